//! Retry behaviour for collaborator HTTP calls
//!
//! Language endpoints answer quickly and tolerate a few fast retries; media
//! generation is slow and expensive, so it backs off harder.

use reqwest::StatusCode;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Cap on any single wait, including server-provided ones
    pub max_delay: Duration,
    pub exponential_backoff: bool,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn language() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            exponential_backoff: true,
            backoff_multiplier: 2.0,
        }
    }

    pub fn media() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            exponential_backoff: true,
            backoff_multiplier: 3.0,
        }
    }

    /// Single attempt; job-level backoff handles the rest
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential_backoff: false,
            backoff_multiplier: 1.0,
        }
    }

    /// Wait before retry number `attempt` (0-based). A server hint wins but
    /// is still capped.
    pub fn calculate_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(server_delay) = retry_after {
            return server_delay.min(self.max_delay);
        }

        let delay = if self.exponential_backoff {
            let multiplier = self.backoff_multiplier.powi(attempt as i32);
            Duration::from_secs_f64(self.base_delay.as_secs_f64() * multiplier)
        } else {
            self.base_delay
        };

        delay.min(self.max_delay)
    }
}

/// Rate-limit hints from a 429 response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitInfo {
    pub retry_after: Option<Duration>,
    /// Time until the window resets (X-RateLimit-Reset)
    pub reset_time: Option<Duration>,
    pub remaining: Option<u32>,
    pub limit: Option<u32>,
}

impl RateLimitInfo {
    pub fn from_headers(headers: &reqwest::header::HeaderMap) -> Self {
        let header = |name: &str| headers.get(name).and_then(|h| h.to_str().ok());

        let retry_after = header("retry-after")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let reset_time = header("x-ratelimit-reset")
            .and_then(|s| s.trim().parse::<i64>().ok())
            .map(|timestamp| {
                let now = chrono::Utc::now().timestamp();
                Duration::from_secs(timestamp.saturating_sub(now).max(0) as u64)
            });

        let remaining = header("x-ratelimit-remaining").and_then(|s| s.trim().parse::<u32>().ok());
        let limit = header("x-ratelimit-limit").and_then(|s| s.trim().parse::<u32>().ok());

        Self {
            retry_after,
            reset_time,
            remaining,
            limit,
        }
    }

    pub fn recommended_delay(&self) -> Option<Duration> {
        self.retry_after.or(self.reset_time)
    }
}

/// Statuses worth another attempt
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 425 | 429 | 500..=599)
}

/// Transport failures worth another attempt
pub fn is_retryable_error(error: &reqwest::Error) -> bool {
    match error.status() {
        Some(status) => is_retryable_status(status),
        None => error.is_timeout() || error.is_connect(),
    }
}
