//! In-process token bucket limiter built on `governor`
//!
//! Waiting callers are served in arrival order: each caller takes a turn on
//! an async mutex before asking governor for its tokens, so a large request
//! can't be starved by a stream of small ones.

use super::domain::BucketLimits;
use crate::log_debug;
use crate::shared::errors::{AppError, AppResult};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter as GovernorRateLimiter,
};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

type DirectLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

pub struct RateLimiter {
    name: String,
    limits: BucketLimits,
    limiter: DirectLimiter,
    turn: Mutex<()>,
    pending: AtomicUsize,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("limits", &self.limits)
            .field("pending", &self.pending_waiters())
            .finish()
    }
}

impl RateLimiter {
    /// Build a limiter allowing `rate_per_second` sustained with bursts of
    /// `burst` (twice the rate when omitted)
    pub fn configure(name: &str, rate_per_second: f64, burst: Option<u32>) -> AppResult<Self> {
        let limits = BucketLimits::new(rate_per_second, burst)?;
        Self::from_limits(name, limits)
    }

    pub fn from_limits(name: &str, limits: BucketLimits) -> AppResult<Self> {
        let period = Duration::from_secs_f64(1.0 / limits.rate_per_second);
        let burst = NonZeroU32::new(limits.burst).ok_or_else(|| {
            AppError::ConfigurationError(format!("{}: burst size must be at least 1", name))
        })?;
        let quota = Quota::with_period(period)
            .ok_or_else(|| {
                AppError::ConfigurationError(format!(
                    "{}: rate {} per second is too high to schedule",
                    name, limits.rate_per_second
                ))
            })?
            .allow_burst(burst);

        Ok(Self {
            name: name.to_string(),
            limits,
            limiter: GovernorRateLimiter::direct(quota),
            turn: Mutex::new(()),
            pending: AtomicUsize::new(0),
        })
    }

    /// Wait until `cost` tokens are available and debit them.
    ///
    /// Only the calling task is suspended. A cost above the burst size fails
    /// straight away instead of queueing forever.
    pub async fn acquire(&self, cost: u32) -> AppResult<()> {
        let Some(n) = self.checked_cost(cost)? else {
            return Ok(());
        };

        let _waiting = PendingGuard::enter(&self.pending);
        let _turn = self.turn.lock().await;

        self.limiter.until_n_ready(n).await.map_err(|e| {
            AppError::ConfigurationError(format!("{}: {}", self.name, e))
        })?;

        log_debug!("{} limiter granted {} token(s)", self.name, cost);
        Ok(())
    }

    /// Take `cost` tokens only if they are available right now
    pub fn try_acquire(&self, cost: u32) -> AppResult<bool> {
        let Some(n) = self.checked_cost(cost)? else {
            return Ok(true);
        };

        match self.limiter.check_n(n) {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_not_until)) => Ok(false),
            Err(e) => Err(AppError::ConfigurationError(format!("{}: {}", self.name, e))),
        }
    }

    fn checked_cost(&self, cost: u32) -> AppResult<Option<NonZeroU32>> {
        self.limits
            .check_cost(cost)
            .map_err(|e| AppError::ConfigurationError(format!("{}: {}", self.name, e)))?;
        Ok(NonZeroU32::new(cost))
    }

    /// Callers currently suspended in `acquire`
    pub fn pending_waiters(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn limits(&self) -> BucketLimits {
        self.limits
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Keeps the waiter count right even when an `acquire` future is dropped
struct PendingGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> PendingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_limiter_creation() {
        let limiter = RateLimiter::configure("language", 2.0, None).unwrap();
        assert_eq!(limiter.name(), "language");
        assert_eq!(limiter.limits().burst, 4);
        assert_eq!(limiter.pending_waiters(), 0);
    }

    #[test]
    fn test_burst_is_available_immediately() {
        let limiter = RateLimiter::configure("image", 1.0, Some(3)).unwrap();
        assert!(limiter.try_acquire(1).unwrap());
        assert!(limiter.try_acquire(2).unwrap());
        assert!(!limiter.try_acquire(1).unwrap());
    }

    #[tokio::test]
    async fn test_cost_above_burst_fails_fast() {
        let limiter = RateLimiter::configure("speech", 1.0, Some(2)).unwrap();
        let err = limiter.acquire(3).await.unwrap_err();
        assert!(matches!(err, AppError::ConfigurationError(_)));
        assert_eq!(limiter.pending_waiters(), 0);
    }

    #[tokio::test]
    async fn test_zero_cost_never_waits() {
        let limiter = RateLimiter::configure("speech", 1.0, Some(1)).unwrap();
        limiter.acquire(1).await.unwrap();
        let start = Instant::now();
        limiter.acquire(0).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_waiters_are_counted_while_suspended() {
        let limiter = Arc::new(RateLimiter::configure("image", 2.0, Some(1)).unwrap());
        limiter.acquire(1).await.unwrap();

        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.pending_waiters(), 1);

        waiting.await.unwrap().unwrap();
        assert_eq!(limiter.pending_waiters(), 0);
    }
}
