/// Background worker that drains one queue with bounded concurrency
///
/// Each dispatched job runs in its own task together with its lock renewal,
/// so aborting the task on shutdown also stops renewing and the lock lapses
/// on its own. Lifecycle events go to `WorkerObserver`s.
use crate::modules::jobs::domain::entities::{JobProgress, JobRecord, JobState};
use crate::modules::jobs::domain::lease::{LeaseGuard, ProgressReporter};
use crate::modules::jobs::domain::repository::JobStore;
use crate::shared::config::WorkerSettings;
use crate::shared::errors::{AppError, AppResult};
use crate::shared::utils::logger::TimedOperation;
use crate::{log_debug, log_error, log_info, log_warn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Processes one job. The returned value is stored as the job result.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext) -> AppResult<serde_json::Value>;
}

/// Lifecycle hooks; every method defaults to doing nothing
pub trait WorkerObserver: Send + Sync {
    fn on_active(&self, _worker: &str, _job: &JobRecord) {}

    fn on_completed(&self, _worker: &str, _job: &JobRecord, _result: &serde_json::Value) {}

    /// `terminal` is true once the job will not be retried
    fn on_failed(&self, _worker: &str, _job: &JobRecord, _error: &AppError, _terminal: bool) {}

    /// Errors outside any handler: store unreachable, lost locks
    fn on_error(&self, _worker: &str, _error: &AppError) {}

    /// Polled and found nothing to do
    fn on_idle(&self, _worker: &str) {}
}

/// What a handler sees of the job it is running
pub struct JobContext {
    job: JobRecord,
    lease: LeaseGuard,
    store: Arc<dyn JobStore>,
}

impl JobContext {
    pub fn new(job: JobRecord, lease: LeaseGuard, store: Arc<dyn JobStore>) -> Self {
        Self { job, lease, store }
    }

    pub fn job(&self) -> &JobRecord {
        &self.job
    }

    pub fn lease(&self) -> &LeaseGuard {
        &self.lease
    }

    /// Store progress for status polling; failures are only logged
    pub async fn report_progress(&self, progress: JobProgress) {
        if let Err(e) = self.store.update_progress(self.job.id, progress).await {
            log_warn!("Could not record progress for job {}: {}", self.job.id, e);
        }
    }
}

#[async_trait]
impl ProgressReporter for JobContext {
    async fn report(&self, progress: JobProgress) {
        self.report_progress(progress).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub name: String,
    pub queue: String,
    pub concurrency: usize,
    pub lock_duration: Duration,
    pub renew_interval: Duration,
    pub poll_interval: Duration,
    /// How often expired locks on the queue are swept back to waiting
    pub stalled_interval: Duration,
    pub shutdown_grace: Duration,
}

impl WorkerConfig {
    pub fn new(name: &str, queue: &str) -> Self {
        let lock_duration = Duration::from_secs(30);
        Self {
            name: name.to_string(),
            queue: queue.to_string(),
            concurrency: 4,
            lock_duration,
            renew_interval: lock_duration / 2,
            poll_interval: Duration::from_secs(1),
            stalled_interval: lock_duration,
            shutdown_grace: Duration::from_secs(10),
        }
    }

    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self::new(&settings.name, &settings.queue)
            .with_concurrency(settings.concurrency)
            .with_lock_duration(settings.lock_duration)
            .with_poll_interval(settings.poll_interval)
            .with_shutdown_grace(settings.shutdown_grace)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Also resets renewal to half and the stalled sweep to the full lock
    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self.renew_interval = lock_duration / 2;
        self.stalled_interval = lock_duration;
        self
    }

    pub fn with_renew_interval(mut self, renew_interval: Duration) -> Self {
        self.renew_interval = renew_interval;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_stalled_interval(mut self, stalled_interval: Duration) -> Self {
        self.stalled_interval = stalled_interval;
        self
    }

    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.concurrency == 0 {
            return Err(AppError::ConfigurationError(
                "worker concurrency must be at least 1".to_string(),
            ));
        }
        if self.renew_interval.is_zero() || self.renew_interval >= self.lock_duration {
            return Err(AppError::ConfigurationError(format!(
                "renew interval {:?} must be shorter than the lock duration {:?}",
                self.renew_interval, self.lock_duration
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
struct WorkerCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
}

/// Worker statistics for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatistics {
    pub is_running: bool,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub in_flight_jobs: usize,
}

struct WorkerInner {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    observers: Vec<Arc<dyn WorkerObserver>>,
    counters: Arc<WorkerCounters>,
}

pub struct Worker {
    inner: WorkerInner,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        handler: Arc<dyn JobHandler>,
    ) -> AppResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: WorkerInner {
                config,
                store,
                handler,
                observers: Vec::new(),
                counters: Arc::new(WorkerCounters::default()),
            },
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn WorkerObserver>) -> Self {
        self.inner.observers.push(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Start polling in the background
    pub fn spawn(self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let counters = self.inner.counters.clone();
        let name = self.inner.config.name.clone();
        let inner = Arc::new(self.inner);
        let join = tokio::spawn(inner.run(shutdown.clone()));

        WorkerHandle {
            name,
            shutdown,
            join,
            counters,
        }
    }

    /// Poll until `shutdown` fires, then drain within the grace period
    pub async fn run_until(self, shutdown: CancellationToken) {
        Arc::new(self.inner).run(shutdown).await
    }
}

impl WorkerInner {
    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let config = &self.config;
        log_info!(
            "Worker {} started on queue '{}' (concurrency {})",
            config.name,
            config.queue,
            config.concurrency
        );

        let slots = Arc::new(Semaphore::new(config.concurrency));
        let mut tasks = JoinSet::new();
        let mut last_sweep: Option<Instant> = None;

        loop {
            while let Some(finished) = tasks.try_join_next() {
                self.reap(finished);
            }

            if last_sweep.map_or(true, |at| at.elapsed() >= config.stalled_interval) {
                self.sweep_stalled().await;
                last_sweep = Some(Instant::now());
            }

            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => permit,
                _ = shutdown.cancelled() => break,
            };
            let Ok(permit) = permit else { break };

            let lock_token = Uuid::new_v4();
            match self
                .store
                .dequeue(&config.queue, lock_token, config.lock_duration)
                .await
            {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    tasks.spawn(async move { worker.execute(job, lock_token, permit).await });
                }
                Ok(None) => {
                    drop(permit);
                    self.notify(|o| o.on_idle(&config.name));
                    if self.pause(&shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    log_error!("Worker {} could not dequeue: {}", config.name, e);
                    self.notify(|o| o.on_error(&config.name, &e));
                    if self.pause(&shutdown).await {
                        break;
                    }
                }
            }
        }

        self.drain(tasks).await;
        log_info!("Worker {} stopped", config.name);
    }

    /// Sleep one poll interval; true if shutdown was requested meanwhile
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => false,
            _ = shutdown.cancelled() => true,
        }
    }

    async fn sweep_stalled(&self) {
        match self.store.requeue_expired(&self.config.queue).await {
            Ok(0) => {}
            Ok(count) => log_warn!(
                "Worker {} requeued {} job(s) with expired locks",
                self.config.name,
                count
            ),
            Err(e) => {
                log_error!("Worker {} stalled-job sweep failed: {}", self.config.name, e);
                self.notify(|o| o.on_error(&self.config.name, &e));
            }
        }
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        log_info!(
            "Worker {} waiting up to {:?} for {} in-flight job(s)",
            self.config.name,
            self.config.shutdown_grace,
            tasks.len()
        );

        let grace = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(finished) = tasks.join_next().await {
                self.reap(finished);
            }
        })
        .await;

        if grace.is_err() {
            log_warn!(
                "Worker {} abandoning {} job(s) after grace period; their locks will lapse",
                self.config.name,
                tasks.len()
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    fn reap(&self, finished: Result<(), tokio::task::JoinError>) {
        if let Err(e) = finished {
            if e.is_panic() {
                let error = AppError::InternalError(format!("job handler panicked: {}", e));
                log_error!("Worker {}: {}", self.config.name, error);
                self.notify(|o| o.on_error(&self.config.name, &error));
            }
        }
    }

    async fn execute(&self, job: JobRecord, lock_token: Uuid, _permit: OwnedSemaphorePermit) {
        let _in_flight = InFlight::enter(&self.counters.in_flight);
        let config = &self.config;
        let timer = TimedOperation::new(&format!("job {} ({})", job.id, job.job_type));

        log_debug!(
            "Worker {} processing job {} (attempt {}/{})",
            config.name,
            job.id,
            job.attempts_made + 1,
            job.max_attempts
        );
        self.notify(|o| o.on_active(&config.name, &job));

        let lease = LeaseGuard::new(job.id, lock_token);
        let ctx = JobContext::new(job.clone(), lease.clone(), self.store.clone());

        let outcome = {
            let handling = self.handler.handle(&ctx);
            tokio::pin!(handling);

            let start = tokio::time::Instant::now() + config.renew_interval;
            let mut renewals = tokio::time::interval_at(start, config.renew_interval);

            loop {
                tokio::select! {
                    outcome = &mut handling => break outcome,
                    _ = renewals.tick(), if lease.is_held() => {
                        self.renew(&job, &lease).await;
                    }
                }
            }
        };

        if !lease.is_held() {
            let error = AppError::LockLost(format!(
                "job {} finished after losing its lock; result discarded",
                job.id
            ));
            log_warn!("Worker {}: {}", config.name, error);
            self.notify(|o| o.on_error(&config.name, &error));
            return;
        }

        match outcome {
            Ok(result) => match self.store.complete(job.id, lock_token, result.clone()).await {
                Ok(completed) => {
                    self.counters.completed.fetch_add(1, Ordering::SeqCst);
                    timer.finish();
                    self.notify(|o| o.on_completed(&config.name, &completed, &result));
                }
                Err(e) => {
                    log_error!("Worker {} could not complete job {}: {}", config.name, job.id, e);
                    self.notify(|o| o.on_error(&config.name, &e));
                }
            },
            Err(error) => {
                let retryable = error.is_retryable();
                match self
                    .store
                    .fail(job.id, lock_token, &error.to_string(), retryable)
                    .await
                {
                    Ok(failed) => {
                        let terminal = failed.state == JobState::Failed;
                        self.counters.failed.fetch_add(1, Ordering::SeqCst);
                        if terminal {
                            log_error!(
                                "Job {} failed permanently after {} attempt(s): {}",
                                job.id,
                                failed.attempts_made,
                                error
                            );
                        } else {
                            log_warn!(
                                "Job {} failed (attempt {}/{}), will retry: {}",
                                job.id,
                                failed.attempts_made,
                                failed.max_attempts,
                                error
                            );
                        }
                        self.notify(|o| o.on_failed(&config.name, &failed, &error, terminal));
                    }
                    Err(e) => {
                        log_error!("Worker {} could not fail job {}: {}", config.name, job.id, e);
                        self.notify(|o| o.on_error(&config.name, &e));
                    }
                }
            }
        }
    }

    async fn renew(&self, job: &JobRecord, lease: &LeaseGuard) {
        match self
            .store
            .renew_lock(job.id, lease.token(), self.config.lock_duration)
            .await
        {
            Ok(()) => log_debug!("Renewed lock on job {}", job.id),
            Err(AppError::LockLost(reason)) => {
                log_warn!("Job {} lost its lock: {}", job.id, reason);
                lease.mark_lost();
            }
            // Transient; the next tick tries again before the lock lapses
            Err(e) => {
                log_warn!("Could not renew lock on job {}: {}", job.id, e);
                self.notify(|o| o.on_error(&self.config.name, &e));
            }
        }
    }

    fn notify<F: Fn(&dyn WorkerObserver)>(&self, event: F) {
        for observer in &self.observers {
            event(observer.as_ref());
        }
    }
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Control over a spawned worker
pub struct WorkerHandle {
    name: String,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
    counters: Arc<WorkerCounters>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    pub fn statistics(&self) -> WorkerStatistics {
        WorkerStatistics {
            is_running: self.is_running(),
            completed_jobs: self.counters.completed.load(Ordering::SeqCst),
            failed_jobs: self.counters.failed.load(Ordering::SeqCst),
            in_flight_jobs: self.counters.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Stop taking jobs and wait for in-flight ones, bounded by the grace period
    pub async fn shutdown(self) -> AppResult<()> {
        log_info!("Worker {} stop requested", self.name);
        self.shutdown.cancel();
        self.join
            .await
            .map_err(|e| AppError::InternalError(format!("worker {} crashed: {}", self.name, e)))
    }
}
