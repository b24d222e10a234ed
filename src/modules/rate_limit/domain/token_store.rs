use super::token_bucket::BucketLimits;
use crate::shared::errors::AppResult;
use async_trait::async_trait;

/// Shared token accounting for limiters running in several processes.
///
/// Implementations must refill using their own notion of time (the
/// database's clock, for Postgres) so that two processes never credit the
/// same interval twice.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Debit `cost` tokens from the bucket at `key` if available.
    /// Returns `false` when the bucket is short; never waits.
    async fn acquire(&self, key: &str, cost: u32, limits: BucketLimits) -> AppResult<bool>;

    /// Tokens currently available at `key`, if the bucket exists
    async fn available(&self, key: &str) -> AppResult<Option<f64>>;
}
