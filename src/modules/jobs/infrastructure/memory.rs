/// In-memory implementation of `JobStore`
///
/// All state sits behind one async mutex, which makes every operation atomic
/// the same way a row lock does for the Postgres store. Time comes from the
/// injected clock so tests can expire locks and delays without sleeping.
use crate::modules::jobs::domain::entities::{
    JobProgress, JobRecord, JobState, NewJob, RetentionPolicy,
};
use crate::modules::jobs::domain::repository::{JobStatistics, JobStore};
use crate::shared::errors::{AppError, AppResult};
use crate::shared::utils::clock::{to_chrono, Clock, SharedClock, SystemClock};
use crate::shared::utils::logger::LogContext;
use crate::{log_debug, log_warn};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

const LOCK_EXPIRED: &str = "lock expired";

#[derive(Default)]
struct Queues {
    jobs: HashMap<Uuid, JobRecord>,
    next_sequence: i64,
}

#[derive(Clone)]
pub struct InMemoryJobStore {
    clock: SharedClock,
    retention: RetentionPolicy,
    state: Arc<Mutex<Queues>>,
    reachable: Arc<AtomicBool>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            retention: RetentionPolicy::default(),
            state: Arc::new(Mutex::new(Queues::default())),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Simulate the backend going away; `ping` fails while unreachable
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Every job on a queue, oldest first
    pub async fn jobs(&self, queue: &str) -> Vec<JobRecord> {
        let state = self.state.lock().await;
        let mut jobs: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|job| job.queue == queue)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.sequence);
        jobs
    }

    fn owned_job<'a>(
        state: &'a mut Queues,
        job_id: Uuid,
        lock_token: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<&'a mut JobRecord> {
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;

        if !job.holds_lock(lock_token, now) {
            return Err(AppError::LockLost(format!(
                "job {} is {} and no longer locked by this worker",
                job_id, job.state
            )));
        }
        Ok(job)
    }

    fn activate(job: &mut JobRecord, lock_token: Uuid, lock_duration: Duration, now: DateTime<Utc>) {
        job.state = JobState::Active;
        job.lock_token = Some(lock_token);
        job.lock_expires_at = Some(now + to_chrono(lock_duration));
        job.started_at = Some(now);
    }

    /// Record a failed attempt and decide between retry and terminal failure
    fn settle_failure(job: &mut JobRecord, reason: &str, retryable: bool, now: DateTime<Utc>) {
        let from = job.state;
        job.attempts_made += 1;
        job.failed_reason = Some(reason.to_string());
        job.lock_token = None;
        job.lock_expires_at = None;

        if retryable && job.can_retry() {
            let delay = job.backoff.delay_with_jitter(&job.id, job.attempts_made);
            if let Some(payload) = job.follow_up.take() {
                job.payload = payload;
            }
            job.state = JobState::Waiting;
            job.available_at = now + to_chrono(delay);
            log_debug!(
                "Job {} retry {}/{} in {:?}",
                job.id,
                job.attempts_made,
                job.max_attempts,
                delay
            );
        } else {
            job.state = JobState::Failed;
            job.finished_at = Some(now);
        }

        LogContext::job_transition(&job.queue, &job.id, &from.to_string(), &job.state.to_string());
    }

    fn sweep_expired(state: &mut Queues, queue: &str, now: DateTime<Utc>) -> usize {
        let mut touched = 0;
        for job in state
            .jobs
            .values_mut()
            .filter(|job| job.queue == queue && job.lock_expired(now))
        {
            log_warn!(
                "Job {} lost its lock (attempt {}/{})",
                job.id,
                job.attempts_made + 1,
                job.max_attempts
            );
            Self::settle_failure(job, LOCK_EXPIRED, true, now);
            // Crash recovery should not wait out the backoff
            if job.state == JobState::Waiting {
                job.available_at = now;
            }
            touched += 1;
        }
        if touched > 0 {
            Self::release_follow_ups(state, queue, now);
        }
        touched
    }

    fn insert(state: &mut Queues, job: NewJob, now: DateTime<Utc>) -> JobRecord {
        state.next_sequence += 1;
        let record = JobRecord {
            id: Uuid::new_v4(),
            queue: job.queue,
            job_type: job.job_type,
            payload: job.payload,
            priority: job.options.priority,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: job.options.max_attempts.max(1),
            backoff: job.options.backoff,
            dedupe_key: job.options.dedupe_key,
            progress: None,
            result: None,
            failed_reason: None,
            lock_token: None,
            lock_expires_at: None,
            available_at: now + to_chrono(job.options.delay),
            sequence: state.next_sequence,
            created_at: now,
            started_at: None,
            finished_at: None,
            follow_up: None,
        };

        state.jobs.insert(record.id, record.clone());
        record
    }

    /// Queue the follow-ups of jobs that just finished
    fn release_follow_ups(state: &mut Queues, queue: &str, now: DateTime<Utc>) {
        let follow_ups: Vec<NewJob> = state
            .jobs
            .values_mut()
            .filter(|job| job.queue == queue && job.state.is_terminal())
            .filter_map(|job| {
                let next = job.follow_up_job();
                job.follow_up = None;
                next
            })
            .collect();

        for job in follow_ups {
            let record = Self::insert(state, job, now);
            log_debug!("Queued follow-up job {} on '{}'", record.id, queue);
        }
    }

    fn next_eligible(state: &Queues, queue: &str, now: DateTime<Utc>) -> Option<Uuid> {
        state
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.is_eligible(now))
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.sequence.cmp(&a.sequence))
            })
            .map(|job| job.id)
    }

    /// Trim finished jobs on `queue` down to the retention limits
    fn apply_retention(&self, state: &mut Queues, queue: &str, now: DateTime<Utc>) {
        let cutoff = self.retention.max_age.map(|age| now - to_chrono(age));

        for (finished_state, keep) in [
            (JobState::Completed, self.retention.keep_completed),
            (JobState::Failed, self.retention.keep_failed),
        ] {
            let mut finished: Vec<(Uuid, DateTime<Utc>)> = state
                .jobs
                .values()
                .filter(|job| job.queue == queue && job.state == finished_state)
                .map(|job| (job.id, job.finished_at.unwrap_or(job.created_at)))
                .collect();
            finished.sort_by(|a, b| b.1.cmp(&a.1));

            for (index, (id, finished_at)) in finished.into_iter().enumerate() {
                let too_old = cutoff.map_or(false, |cutoff| finished_at < cutoff);
                if index >= keep || too_old {
                    state.jobs.remove(&id);
                }
            }
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> AppResult<JobRecord> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if let Some(key) = job.options.dedupe_key.as_deref() {
            if let Some(existing) = state.jobs.values_mut().find(|existing| {
                existing.queue == job.queue
                    && existing.state.is_outstanding()
                    && existing.dedupe_key.as_deref() == Some(key)
            }) {
                if job.options.supersede {
                    existing.priority = existing.priority.max(job.options.priority);
                    if existing.state == JobState::Active {
                        log_debug!("Follow-up for '{}' queued behind {}", key, existing.id);
                        existing.follow_up = Some(job.payload);
                    } else {
                        log_debug!("Superseding payload of waiting job {}", existing.id);
                        existing.payload = job.payload;
                    }
                } else {
                    log_debug!("Job for '{}' already outstanding as {}", key, existing.id);
                }
                return Ok(existing.clone());
            }
        }

        Ok(Self::insert(&mut state, job, now))
    }

    async fn dequeue(
        &self,
        queue: &str,
        lock_token: Uuid,
        lock_duration: Duration,
    ) -> AppResult<Option<JobRecord>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if Self::sweep_expired(&mut state, queue, now) > 0 {
            self.apply_retention(&mut state, queue, now);
        }

        let Some(id) = Self::next_eligible(&state, queue, now) else {
            return Ok(None);
        };

        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| AppError::InternalError(format!("Job {} vanished", id)))?;
        Self::activate(job, lock_token, lock_duration, now);
        LogContext::job_transition(queue, &id, "waiting", "active");

        Ok(Some(job.clone()))
    }

    async fn mark_active(
        &self,
        job_id: Uuid,
        lock_token: Uuid,
        lock_duration: Duration,
    ) -> AppResult<JobRecord> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;

        if !job.is_eligible(now) {
            return Err(AppError::InvalidInput(format!(
                "Job {} cannot be activated while {}{}",
                job_id,
                job.state,
                if job.is_delayed(now) { " (delayed)" } else { "" }
            )));
        }

        Self::activate(job, lock_token, lock_duration, now);
        LogContext::job_transition(&job.queue, &job_id, "waiting", "active");
        Ok(job.clone())
    }

    async fn renew_lock(
        &self,
        job_id: Uuid,
        lock_token: Uuid,
        lock_duration: Duration,
    ) -> AppResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = Self::owned_job(&mut state, job_id, lock_token, now)?;
        job.lock_expires_at = Some(now + to_chrono(lock_duration));
        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        lock_token: Uuid,
        result: serde_json::Value,
    ) -> AppResult<JobRecord> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let job = Self::owned_job(&mut state, job_id, lock_token, now)?;
        job.state = JobState::Completed;
        job.result = Some(result);
        job.failed_reason = None;
        job.lock_token = None;
        job.lock_expires_at = None;
        job.finished_at = Some(now);

        let completed = job.clone();
        LogContext::job_transition(&completed.queue, &job_id, "active", "completed");
        Self::release_follow_ups(&mut state, &completed.queue, now);
        self.apply_retention(&mut state, &completed.queue, now);
        Ok(completed)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        lock_token: Uuid,
        reason: &str,
        retryable: bool,
    ) -> AppResult<JobRecord> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let job = Self::owned_job(&mut state, job_id, lock_token, now)?;
        Self::settle_failure(job, reason, retryable, now);

        let failed = job.clone();
        if failed.state.is_terminal() {
            Self::release_follow_ups(&mut state, &failed.queue, now);
            self.apply_retention(&mut state, &failed.queue, now);
        }
        Ok(failed)
    }

    async fn update_progress(&self, job_id: Uuid, progress: JobProgress) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;
        job.progress = Some(progress);
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> AppResult<Option<JobRecord>> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).cloned())
    }

    async fn find_outstanding(
        &self,
        queue: &str,
        dedupe_key: &str,
    ) -> AppResult<Option<JobRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .find(|job| {
                job.queue == queue
                    && job.state.is_outstanding()
                    && job.dedupe_key.as_deref() == Some(dedupe_key)
            })
            .cloned())
    }

    async fn requeue_expired(&self, queue: &str) -> AppResult<usize> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let touched = Self::sweep_expired(&mut state, queue, now);
        if touched > 0 {
            self.apply_retention(&mut state, queue, now);
        }
        Ok(touched)
    }

    async fn statistics(&self, queue: &str) -> AppResult<JobStatistics> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let mut stats = JobStatistics::default();

        for job in state.jobs.values().filter(|job| job.queue == queue) {
            match job.state {
                JobState::Waiting if job.is_delayed(now) => stats.delayed_count += 1,
                JobState::Waiting => stats.waiting_count += 1,
                JobState::Active => stats.active_count += 1,
                JobState::Completed => stats.completed_count += 1,
                JobState::Failed => stats.failed_count += 1,
            }
            stats.total_count += 1;
        }
        Ok(stats)
    }

    async fn delete_finished_older_than(&self, max_age: Duration) -> AppResult<usize> {
        let cutoff = self.clock.now() - to_chrono(max_age);
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.state.is_terminal() && job.finished_at.map_or(false, |at| at < cutoff))
        });
        Ok(before - state.jobs.len())
    }

    async fn ping(&self) -> AppResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::DatabaseError(
                "job store backend unreachable".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::jobs::domain::{BackoffPolicy, EnqueueOptions, JobType};
    use crate::shared::utils::clock::ManualClock;

    const QUEUE: &str = "enrichment";
    const LOCK: Duration = Duration::from_secs(30);

    fn store() -> (InMemoryJobStore, ManualClock) {
        let clock = ManualClock::default();
        (InMemoryJobStore::with_clock(Arc::new(clock.clone())), clock)
    }

    fn job(priority: i32) -> NewJob {
        NewJob::new(
            QUEUE,
            JobType::EnrichEntity,
            &serde_json::json!({"entity_id": Uuid::new_v4()}),
            EnqueueOptions {
                priority,
                backoff: BackoffPolicy::fixed(Duration::from_secs(1)),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let (store, _) = store();
        let low = store.enqueue(job(0)).await.unwrap();
        let first_high = store.enqueue(job(5)).await.unwrap();
        let second_high = store.enqueue(job(5)).await.unwrap();

        let token = Uuid::new_v4();
        let order: Vec<Uuid> = [
            store.dequeue(QUEUE, token, LOCK).await.unwrap(),
            store.dequeue(QUEUE, token, LOCK).await.unwrap(),
            store.dequeue(QUEUE, token, LOCK).await.unwrap(),
        ]
        .into_iter()
        .map(|job| job.unwrap().id)
        .collect();

        assert_eq!(order, vec![first_high.id, second_high.id, low.id]);
        assert!(store.dequeue(QUEUE, token, LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_job_waits_for_its_gate() {
        let (store, clock) = store();
        let mut delayed = job(0);
        delayed.options.delay = Duration::from_secs(10);
        store.enqueue(delayed).await.unwrap();

        let token = Uuid::new_v4();
        assert!(store.dequeue(QUEUE, token, LOCK).await.unwrap().is_none());
        assert_eq!(store.statistics(QUEUE).await.unwrap().delayed_count, 1);

        clock.advance(Duration::from_secs(10));
        assert!(store.dequeue(QUEUE, token, LOCK).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mark_active_refuses_double_dispatch() {
        let (store, _) = store();
        let queued = store.enqueue(job(0)).await.unwrap();

        store
            .mark_active(queued.id, Uuid::new_v4(), LOCK)
            .await
            .unwrap();
        let err = store
            .mark_active(queued.id, Uuid::new_v4(), LOCK)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_stale_token_cannot_complete() {
        let (store, _) = store();
        store.enqueue(job(0)).await.unwrap();
        let active = store
            .dequeue(QUEUE, Uuid::new_v4(), LOCK)
            .await
            .unwrap()
            .unwrap();

        let err = store
            .complete(active.id, Uuid::new_v4(), serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::LockLost(_)));

        let err = store
            .renew_lock(active.id, Uuid::new_v4(), LOCK)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::LockLost(_)));
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_terminal() {
        let (store, _) = store();
        store.enqueue(job(0)).await.unwrap();
        let token = Uuid::new_v4();
        let active = store.dequeue(QUEUE, token, LOCK).await.unwrap().unwrap();

        let failed = store
            .fail(active.id, token, "cost exceeds burst", false)
            .await
            .unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.attempts_made, 1);
        assert_eq!(failed.failed_reason.as_deref(), Some("cost exceeds burst"));
    }

    #[tokio::test]
    async fn test_dedupe_key_returns_outstanding_job() {
        let (store, _) = store();
        let mut first = job(0);
        first.options.dedupe_key = Some("entity:1".to_string());
        let mut second = job(9);
        second.options.dedupe_key = Some("entity:1".to_string());

        let a = store.enqueue(first.clone()).await.unwrap();
        let b = store.enqueue(second).await.unwrap();
        assert_eq!(a.id, b.id);

        let token = Uuid::new_v4();
        store.dequeue(QUEUE, token, LOCK).await.unwrap();
        store.complete(a.id, token, serde_json::json!(null)).await.unwrap();

        let c = store.enqueue(first).await.unwrap();
        assert_ne!(a.id, c.id);
    }

    fn keyed(priority: i32, force: bool) -> NewJob {
        let mut job = job(priority);
        job.payload = serde_json::json!({"entity_id": "e1", "force": force});
        job.options.dedupe_key = Some("entity:e1".to_string());
        job.options.supersede = force;
        job
    }

    #[tokio::test]
    async fn test_superseding_enqueue_rewrites_waiting_job() {
        let (store, _) = store();
        let waiting = store.enqueue(keyed(0, false)).await.unwrap();
        let forced = store.enqueue(keyed(3, true)).await.unwrap();

        assert_eq!(forced.id, waiting.id);
        assert_eq!(forced.payload["force"], true);
        assert_eq!(forced.priority, 3);
        assert!(forced.follow_up.is_none());
        assert_eq!(store.jobs(QUEUE).await.len(), 1);

        // A plain request never downgrades it again
        let plain = store.enqueue(keyed(0, false)).await.unwrap();
        assert_eq!(plain.payload["force"], true);
    }

    #[tokio::test]
    async fn test_superseding_enqueue_runs_after_active_job() {
        let (store, _) = store();
        let token = Uuid::new_v4();
        store.enqueue(keyed(0, false)).await.unwrap();
        let active = store.dequeue(QUEUE, token, LOCK).await.unwrap().unwrap();

        let forced = store.enqueue(keyed(0, true)).await.unwrap();
        assert_eq!(forced.id, active.id);
        assert_eq!(forced.follow_up, Some(serde_json::json!({"entity_id": "e1", "force": true})));

        // Nothing else may run for the key while the active job holds it
        assert!(store.dequeue(QUEUE, Uuid::new_v4(), LOCK).await.unwrap().is_none());

        store.complete(active.id, token, serde_json::json!(null)).await.unwrap();
        let next = store.dequeue(QUEUE, token, LOCK).await.unwrap().unwrap();
        assert_ne!(next.id, active.id);
        assert_eq!(next.payload["force"], true);
        assert_eq!(next.attempts_made, 0);
        assert_eq!(next.dedupe_key.as_deref(), Some("entity:e1"));
    }

    #[tokio::test]
    async fn test_follow_up_replaces_payload_of_retried_job() {
        let (store, clock) = store();
        let token = Uuid::new_v4();
        store.enqueue(keyed(0, false)).await.unwrap();
        let active = store.dequeue(QUEUE, token, LOCK).await.unwrap().unwrap();
        store.enqueue(keyed(0, true)).await.unwrap();

        let retried = store.fail(active.id, token, "timeout", true).await.unwrap();
        assert_eq!(retried.state, JobState::Waiting);
        assert_eq!(retried.payload["force"], true);
        assert!(retried.follow_up.is_none());

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.jobs(QUEUE).await.len(), 1);
    }

    #[tokio::test]
    async fn test_retention_trims_oldest_finished_jobs() {
        let (store, clock) = store();
        let store = store.with_retention(RetentionPolicy {
            keep_completed: 2,
            keep_failed: 2,
            max_age: None,
        });
        let token = Uuid::new_v4();

        for _ in 0..4 {
            store.enqueue(job(0)).await.unwrap();
            let active = store.dequeue(QUEUE, token, LOCK).await.unwrap().unwrap();
            clock.advance(Duration::from_secs(1));
            store.complete(active.id, token, serde_json::json!(1)).await.unwrap();
        }

        assert_eq!(store.statistics(QUEUE).await.unwrap().completed_count, 2);
    }

    #[tokio::test]
    async fn test_delete_finished_older_than_max_age() {
        let (store, clock) = store();
        let token = Uuid::new_v4();
        store.enqueue(job(0)).await.unwrap();
        let active = store.dequeue(QUEUE, token, LOCK).await.unwrap().unwrap();
        store.complete(active.id, token, serde_json::json!(1)).await.unwrap();
        store.enqueue(job(0)).await.unwrap();

        clock.advance(Duration::from_secs(60));
        let max_age = Duration::from_secs(120);
        assert_eq!(store.delete_finished_older_than(max_age).await.unwrap(), 0);

        clock.advance(Duration::from_secs(61));
        assert_eq!(store.delete_finished_older_than(max_age).await.unwrap(), 1);
        assert_eq!(store.statistics(QUEUE).await.unwrap().total_count, 1);
    }

    #[tokio::test]
    async fn test_ping_follows_reachability() {
        let (store, _) = store();
        assert!(store.ping().await.is_ok());
        store.set_reachable(false);
        assert!(store.ping().await.is_err());
    }
}
