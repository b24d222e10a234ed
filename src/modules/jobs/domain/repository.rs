/// Storage port for the job queue
///
/// Implementations must make `dequeue` atomic: two workers polling the same
/// queue never receive the same job.
use crate::modules::jobs::domain::entities::{JobProgress, JobRecord, JobStatusSnapshot, NewJob};
use crate::shared::errors::{AppError, AppResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a new waiting job. With a dedupe key, an outstanding job with the
    /// same key on the same queue is returned instead.
    async fn enqueue(&self, job: NewJob) -> AppResult<JobRecord>;

    /// Take the next eligible job (highest priority, then oldest) and mark it
    /// active under `lock_token`. Jobs whose lock lapsed are requeued first.
    async fn dequeue(
        &self,
        queue: &str,
        lock_token: Uuid,
        lock_duration: Duration,
    ) -> AppResult<Option<JobRecord>>;

    /// Take up to `limit` jobs under the same lock token
    async fn dequeue_batch(
        &self,
        queue: &str,
        limit: usize,
        lock_token: Uuid,
        lock_duration: Duration,
    ) -> AppResult<Vec<JobRecord>> {
        let mut jobs = Vec::with_capacity(limit);
        while jobs.len() < limit {
            match self.dequeue(queue, lock_token, lock_duration).await? {
                Some(job) => jobs.push(job),
                None => break,
            }
        }
        Ok(jobs)
    }

    /// waiting -> active for a specific job; fails if it is not eligible
    async fn mark_active(
        &self,
        job_id: Uuid,
        lock_token: Uuid,
        lock_duration: Duration,
    ) -> AppResult<JobRecord>;

    /// Extend the lease. `LockLost` if another holder took over.
    async fn renew_lock(&self, job_id: Uuid, lock_token: Uuid, lock_duration: Duration)
        -> AppResult<()>;

    /// active -> completed
    async fn complete(
        &self,
        job_id: Uuid,
        lock_token: Uuid,
        result: serde_json::Value,
    ) -> AppResult<JobRecord>;

    /// Count a failed attempt: back to waiting after the backoff delay, or
    /// failed when attempts are exhausted or the error is not retryable
    async fn fail(
        &self,
        job_id: Uuid,
        lock_token: Uuid,
        reason: &str,
        retryable: bool,
    ) -> AppResult<JobRecord>;

    /// Informational only
    async fn update_progress(&self, job_id: Uuid, progress: JobProgress) -> AppResult<()>;

    async fn get(&self, job_id: Uuid) -> AppResult<Option<JobRecord>>;

    async fn get_status(&self, job_id: Uuid) -> AppResult<JobStatusSnapshot> {
        self.get(job_id)
            .await?
            .map(|job| job.status())
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))
    }

    /// Waiting or active job carrying `dedupe_key`
    async fn find_outstanding(&self, queue: &str, dedupe_key: &str)
        -> AppResult<Option<JobRecord>>;

    /// Return active jobs whose lock lapsed to waiting (or failed, once out of
    /// attempts). Returns how many were touched.
    async fn requeue_expired(&self, queue: &str) -> AppResult<usize>;

    async fn statistics(&self, queue: &str) -> AppResult<JobStatistics>;

    /// Delete completed and failed jobs that finished more than `max_age`
    /// ago, measured by the store's own clock
    async fn delete_finished_older_than(&self, max_age: Duration) -> AppResult<usize>;

    /// Backend connectivity check
    async fn ping(&self) -> AppResult<()>;
}

/// Job queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub waiting_count: i64,
    pub delayed_count: i64,
    pub active_count: i64,
    pub completed_count: i64,
    pub failed_count: i64,
    pub total_count: i64,
}

impl JobStatistics {
    /// Jobs not yet finished, the backlog used to size batches
    pub fn backlog(&self) -> i64 {
        self.waiting_count + self.delayed_count + self.active_count
    }
}
