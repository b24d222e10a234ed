use crate::modules::rate_limit::domain::{BucketLimits, TokenBucket, TokenStore};
use crate::shared::errors::AppResult;
use crate::shared::utils::clock::{Clock, SharedClock, SystemClock};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Token store shared between limiters inside one process.
///
/// Every handle refills against the store's own clock, which is what the
/// database clock is for `PgTokenStore`.
#[derive(Clone)]
pub struct InMemoryTokenStore {
    clock: SharedClock,
    buckets: Arc<Mutex<HashMap<String, TokenBucket>>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn acquire(&self, key: &str, cost: u32, limits: BucketLimits) -> AppResult<bool> {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().await;

        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(limits, now));

        bucket.try_take(cost, now)
    }

    async fn available(&self, key: &str) -> AppResult<Option<f64>> {
        let now = self.clock.now();
        let buckets = self.buckets.lock().await;
        Ok(buckets.get(key).map(|bucket| bucket.available(now)))
    }
}
