use crate::shared::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Burst used when none is configured: twice the sustained rate, at least one
pub fn default_burst(rate_per_second: f64) -> u32 {
    (rate_per_second * 2.0).ceil().max(1.0).min(u32::MAX as f64) as u32
}

/// Rate and capacity of one bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketLimits {
    pub rate_per_second: f64,
    pub burst: u32,
}

impl BucketLimits {
    pub fn new(rate_per_second: f64, burst: Option<u32>) -> AppResult<Self> {
        if !rate_per_second.is_finite() || rate_per_second <= 0.0 {
            return Err(AppError::ConfigurationError(format!(
                "rate must be a positive number of tokens per second, got {}",
                rate_per_second
            )));
        }

        let burst = burst.unwrap_or_else(|| default_burst(rate_per_second));
        if burst == 0 {
            return Err(AppError::ConfigurationError(
                "burst size must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            rate_per_second,
            burst,
        })
    }

    /// A request costing more than the burst can never be satisfied
    pub fn check_cost(&self, cost: u32) -> AppResult<()> {
        if cost > self.burst {
            return Err(AppError::ConfigurationError(format!(
                "cost {} exceeds burst capacity {}",
                cost, self.burst
            )));
        }
        Ok(())
    }
}

/// Token bucket with lazily computed refill.
///
/// The bucket never reads a clock itself; every operation takes `now` so the
/// caller decides whose time is authoritative (the shared store's, for the
/// distributed limiter).
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    limits: BucketLimits,
    tokens: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    /// New bucket, starting full
    pub fn new(limits: BucketLimits, now: DateTime<Utc>) -> Self {
        Self {
            limits,
            tokens: limits.burst as f64,
            last_refill: now,
        }
    }

    pub fn limits(&self) -> BucketLimits {
        self.limits
    }

    pub fn last_refill(&self) -> DateTime<Utc> {
        self.last_refill
    }

    /// Tokens that would be available at `now`, without mutating the bucket
    pub fn available(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = (now - self.last_refill)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        (self.tokens + elapsed * self.limits.rate_per_second).min(self.limits.burst as f64)
    }

    /// Apply the refill owed since the last observation.
    ///
    /// A `now` earlier than the last refill (clock went backwards) adds
    /// nothing and keeps the later timestamp.
    pub fn refill(&mut self, now: DateTime<Utc>) {
        if now <= self.last_refill {
            return;
        }
        self.tokens = self.available(now);
        self.last_refill = now;
    }

    /// Debit `cost` tokens if they are available at `now`
    pub fn try_take(&mut self, cost: u32, now: DateTime<Utc>) -> AppResult<bool> {
        self.limits.check_cost(cost)?;
        self.refill(now);

        let cost = cost as f64;
        if self.tokens + f64::EPSILON >= cost {
            self.tokens = (self.tokens - cost).max(0.0);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// How long until `cost` tokens will be available
    pub fn time_until(&self, cost: u32, now: DateTime<Utc>) -> Duration {
        let missing = cost as f64 - self.available(now);
        if missing <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(missing / self.limits.rate_per_second)
        }
    }
}
