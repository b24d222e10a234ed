use super::domain::{BucketLimits, TokenStore};
use crate::shared::errors::{AppError, AppResult};
use crate::{log_debug, log_warn};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Limiter whose tokens live in a store shared by every worker process.
///
/// The store never blocks; this type turns its yes/no answer into a wait by
/// retrying with jittered exponential backoff, up to `max_wait`.
#[derive(Clone)]
pub struct DistributedRateLimiter {
    key: String,
    limits: BucketLimits,
    store: Arc<dyn TokenStore>,
    max_wait: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl std::fmt::Debug for DistributedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRateLimiter")
            .field("key", &self.key)
            .field("limits", &self.limits)
            .field("max_wait", &self.max_wait)
            .finish()
    }
}

impl DistributedRateLimiter {
    pub fn new(
        key: &str,
        limits: BucketLimits,
        store: Arc<dyn TokenStore>,
        max_wait: Duration,
    ) -> Self {
        // Start near the time one token takes to refill
        let token_period = Duration::from_secs_f64(1.0 / limits.rate_per_second);
        let initial_backoff = token_period
            .clamp(Duration::from_millis(10), Duration::from_millis(500));

        Self {
            key: key.to_string(),
            limits,
            store,
            max_wait,
            initial_backoff,
            max_backoff: Duration::from_secs(2),
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub async fn acquire(&self, cost: u32) -> AppResult<()> {
        self.limits.check_cost(cost)?;
        if cost == 0 {
            return Ok(());
        }

        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if self.store.acquire(&self.key, cost, self.limits).await? {
                if attempt > 0 {
                    log_debug!(
                        "{} granted {} token(s) after {} retries",
                        self.key,
                        cost,
                        attempt
                    );
                }
                return Ok(());
            }

            let elapsed = started.elapsed();
            if elapsed >= self.max_wait {
                log_warn!(
                    "{} could not get {} token(s) within {:?}",
                    self.key,
                    cost,
                    self.max_wait
                );
                return Err(AppError::RateLimitExceeded(format!(
                    "{}: no capacity within {:?}",
                    self.key, self.max_wait
                )));
            }

            let pause = self.backoff_for(attempt).min(self.max_wait - elapsed);
            tokio::time::sleep(pause).await;
            attempt = attempt.saturating_add(1);
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max_backoff);
        let jitter_ms = (base.as_millis() as u64 / 2).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    pub fn limits(&self) -> BucketLimits {
        self.limits
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}
