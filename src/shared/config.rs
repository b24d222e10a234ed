//! Runtime configuration loaded from the environment
//!
//! `.env` is honoured through `dotenvy`; every value has a default so a bare
//! `enrichment-worker` starts with in-memory stores and local rate limiting.

use crate::shared::errors::{AppError, AppResult};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitMode {
    Local,
    Distributed,
}

impl FromStr for RateLimitMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(RateLimitMode::Local),
            "distributed" => Ok(RateLimitMode::Distributed),
            other => Err(AppError::ConfigurationError(format!(
                "RATE_LIMIT_MODE must be 'local' or 'distributed', got '{}'",
                other
            ))),
        }
    }
}

/// Rate and burst for one external dependency
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceRate {
    pub rate_per_second: f64,
    pub burst: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitSettings {
    pub mode: RateLimitMode,
    pub max_wait: Duration,
    pub language: ServiceRate,
    pub image: ServiceRate,
    pub speech: ServiceRate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub name: String,
    pub queue: String,
    pub concurrency: usize,
    pub lock_duration: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSettings {
    pub size: usize,
    pub max_size: usize,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthSettings {
    pub max_age: Duration,
    pub ping_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub collaborator_base_url: Option<String>,
    pub media_dir: String,
    pub job_retention_days: u32,
    pub worker: WorkerSettings,
    pub rate_limits: RateLimitSettings,
    pub batch: BatchSettings,
    pub health: HealthSettings,
}

impl AppConfig {
    /// Load `.env` (if present) and read the process environment
    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from any name -> value lookup
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup: &lookup };

        let worker = WorkerSettings {
            name: vars
                .string("WORKER_NAME")
                .unwrap_or_else(|| "enrichment-worker".to_string()),
            queue: vars
                .string("ENRICHMENT_QUEUE")
                .unwrap_or_else(|| crate::modules::jobs::queues::ENRICHMENT.to_string()),
            concurrency: vars.parse("WORKER_CONCURRENCY", 4usize)?,
            lock_duration: vars.millis("LOCK_DURATION_MS", 30_000)?,
            poll_interval: vars.millis("POLL_INTERVAL_MS", 1_000)?,
            shutdown_grace: vars.millis("SHUTDOWN_GRACE_MS", 10_000)?,
        };

        if worker.concurrency == 0 {
            return Err(AppError::ConfigurationError(
                "WORKER_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if worker.lock_duration < Duration::from_millis(100) {
            return Err(AppError::ConfigurationError(
                "LOCK_DURATION_MS must be at least 100".to_string(),
            ));
        }

        let rate_limits = RateLimitSettings {
            mode: vars
                .string("RATE_LIMIT_MODE")
                .map(|m| m.parse::<RateLimitMode>())
                .transpose()?
                .unwrap_or(RateLimitMode::Local),
            max_wait: vars.millis("RATE_LIMIT_MAX_WAIT_MS", 30_000)?,
            language: vars.service_rate("LANGUAGE", 2.0)?,
            image: vars.service_rate("IMAGE", 0.5)?,
            speech: vars.service_rate("SPEECH", 3.0)?,
        };

        let batch = BatchSettings {
            size: vars.parse("BATCH_SIZE", 10usize)?,
            max_size: vars.parse("BATCH_MAX_SIZE", 50usize)?,
            delay: vars.millis("BATCH_DELAY_MS", 2_000)?,
        };

        if batch.size == 0 || batch.max_size < batch.size {
            return Err(AppError::ConfigurationError(format!(
                "BATCH_SIZE ({}) must be at least 1 and not exceed BATCH_MAX_SIZE ({})",
                batch.size, batch.max_size
            )));
        }

        let health = HealthSettings {
            max_age: Duration::from_secs(vars.parse("HEALTH_MAX_AGE_SECS", 120u64)?),
            ping_interval: Duration::from_secs(vars.parse("HEALTH_PING_INTERVAL_SECS", 30u64)?),
        };

        Ok(Self {
            database_url: vars.string("DATABASE_URL"),
            collaborator_base_url: vars.string("COLLABORATOR_BASE_URL"),
            media_dir: vars
                .string("MEDIA_DIR")
                .unwrap_or_else(|| "./media".to_string()),
            job_retention_days: vars.parse("JOB_RETENTION_DAYS", 7u32)?,
            worker,
            rate_limits,
            batch,
            health,
        })
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<'a, F: Fn(&str) -> Option<String>> Vars<'a, F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(name) {
            Some(raw) => raw.parse::<T>().map_err(|e| {
                AppError::ConfigurationError(format!("{} has invalid value '{}': {}", name, raw, e))
            }),
            None => Ok(default),
        }
    }

    fn millis(&self, name: &str, default_ms: u64) -> AppResult<Duration> {
        self.parse(name, default_ms).map(Duration::from_millis)
    }

    fn service_rate(&self, prefix: &str, default_rate: f64) -> AppResult<ServiceRate> {
        let rate_name = format!("{}_RATE_PER_SEC", prefix);
        let rate_per_second = self.parse(&rate_name, default_rate)?;
        if !(rate_per_second > 0.0) || !rate_per_second.is_finite() {
            return Err(AppError::ConfigurationError(format!(
                "{} must be a positive number",
                rate_name
            )));
        }

        let burst = match self.string(&format!("{}_BURST", prefix)) {
            Some(raw) => Some(raw.parse::<u32>().map_err(|e| {
                AppError::ConfigurationError(format!("{}_BURST is invalid: {}", prefix, e))
            })?),
            None => None,
        };

        Ok(ServiceRate {
            rate_per_second,
            burst,
        })
    }
}
