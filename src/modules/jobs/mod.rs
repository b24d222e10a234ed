/// Background job system module
///
/// Durable named queues with priority, delay, retry with backoff and
/// lock-based ownership, plus the worker that drains them.
///
/// Architecture:
/// - Domain: entities, backoff policy, lease guard and the `JobStore` port
/// - Infrastructure: in-memory store and the Diesel-based Postgres store
/// - Worker: polls one queue and runs a `JobHandler` per job
pub mod domain;
pub mod infrastructure;
pub mod queues;
pub mod worker;

// Re-exports for easy access
pub use domain::{
    BackoffPolicy, EnqueueOptions, EnrichEntityPayload, JobProgress, JobRecord, JobState,
    JobStatistics, JobStatusSnapshot, JobStore, JobType, LeaseGuard, NewJob, NoProgress,
    ProgressReporter, RefreshInsightsPayload, RetentionPolicy,
};
pub use infrastructure::InMemoryJobStore;
#[cfg(feature = "postgres")]
pub use infrastructure::PgJobStore;
pub use worker::{
    JobContext, JobHandler, Worker, WorkerConfig, WorkerHandle, WorkerObserver, WorkerStatistics,
};
