use crate::modules::jobs::domain::entities::JobProgress;
use crate::shared::errors::{AppError, AppResult};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Ownership of one job's lock, as seen by the code processing it.
///
/// The worker flips it when a renewal fails; handlers call `ensure_held`
/// before every write so a job that lost its lock stops mutating state.
#[derive(Debug, Clone)]
pub struct LeaseGuard {
    job_id: Uuid,
    token: Uuid,
    lost: CancellationToken,
}

impl LeaseGuard {
    pub fn new(job_id: Uuid, token: Uuid) -> Self {
        Self {
            job_id,
            token,
            lost: CancellationToken::new(),
        }
    }

    /// Guard that never reports loss, for running the pipeline outside a job
    pub fn detached() -> Self {
        Self::new(Uuid::nil(), Uuid::nil())
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn mark_lost(&self) {
        self.lost.cancel();
    }

    pub fn is_held(&self) -> bool {
        !self.lost.is_cancelled()
    }

    pub fn ensure_held(&self) -> AppResult<()> {
        if self.is_held() {
            Ok(())
        } else {
            Err(AppError::LockLost(format!(
                "lock on job {} is no longer held",
                self.job_id
            )))
        }
    }

    /// Resolves once the lease is lost
    pub async fn lost(&self) {
        self.lost.cancelled().await
    }
}

/// Receives per-stage progress from long-running work
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, progress: JobProgress);
}

/// Drops progress on the floor
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

#[async_trait]
impl ProgressReporter for NoProgress {
    async fn report(&self, _progress: JobProgress) {}
}
