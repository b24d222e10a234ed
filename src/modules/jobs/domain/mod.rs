pub mod backoff;
pub mod entities;
pub mod lease;
pub mod repository;
#[cfg(feature = "postgres")]
pub mod value_objects;

pub use backoff::BackoffPolicy;
pub use entities::{
    EnqueueOptions, EnrichEntityPayload, JobProgress, JobRecord, JobState, JobStatusSnapshot,
    JobType, NewJob, ProgressCounts, RefreshInsightsPayload, RetentionPolicy,
};
pub use lease::{LeaseGuard, NoProgress, ProgressReporter};
pub use repository::{JobStatistics, JobStore};
