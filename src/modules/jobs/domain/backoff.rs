use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Longest a retry is ever postponed
const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Share of the delay added as jitter, at most
const JITTER_SHARE: f64 = 0.2;

/// Retry delay policy. Pure: no timers, no randomness source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    Fixed { delay_ms: u64 },
    Exponential { delay_ms: u64, jitter: bool },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            delay_ms: 5_000,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        BackoffPolicy::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn exponential(delay: Duration) -> Self {
        BackoffPolicy::Exponential {
            delay_ms: delay.as_millis() as u64,
            jitter: false,
        }
    }

    pub fn exponential_with_jitter(delay: Duration) -> Self {
        BackoffPolicy::Exponential {
            delay_ms: delay.as_millis() as u64,
            jitter: true,
        }
    }

    /// Delay before the next attempt once `attempts_made` attempts have failed:
    /// `delay * 2^(attempts_made - 1)` for the exponential policy
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        if attempts_made == 0 {
            return Duration::ZERO;
        }

        match *self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms).min(MAX_BACKOFF),
            BackoffPolicy::Exponential { delay_ms, .. } => {
                let factor = 2u64.saturating_pow((attempts_made - 1).min(32));
                Duration::from_millis(delay_ms.saturating_mul(factor)).min(MAX_BACKOFF)
            }
        }
    }

    /// `delay_for` plus jitter derived from the job and attempt, so the same
    /// job retried on two machines waits the same time
    pub fn delay_with_jitter(&self, job_id: &Uuid, attempts_made: u32) -> Duration {
        let base = self.delay_for(attempts_made);
        match *self {
            BackoffPolicy::Exponential { jitter: true, .. } if !base.is_zero() => {
                let extra = base.as_secs_f64() * JITTER_SHARE * jitter_fraction(job_id, attempts_made);
                (base + Duration::from_secs_f64(extra)).min(MAX_BACKOFF)
            }
            _ => base,
        }
    }
}

/// Stable value in `[0, 1)` for a job and attempt (splitmix64 finaliser)
fn jitter_fraction(job_id: &Uuid, attempt: u32) -> f64 {
    let (high, low) = job_id.as_u64_pair();
    let mut x = high ^ low.rotate_left(17) ^ (attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;
    (x >> 11) as f64 / (1u64 << 53) as f64
}
