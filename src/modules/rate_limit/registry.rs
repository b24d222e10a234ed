use super::distributed::DistributedRateLimiter;
use super::domain::{BucketLimits, ExternalService, TokenStore};
use super::limiter::RateLimiter;
use crate::log_info;
use crate::shared::config::{RateLimitMode, RateLimitSettings, ServiceRate};
use crate::shared::errors::{AppError, AppResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Limiter for one external service, either process-local or shared
#[derive(Debug)]
pub enum ServiceLimiter {
    Local(RateLimiter),
    Distributed(DistributedRateLimiter),
}

impl ServiceLimiter {
    pub async fn acquire(&self, cost: u32) -> AppResult<()> {
        match self {
            ServiceLimiter::Local(limiter) => limiter.acquire(cost).await,
            ServiceLimiter::Distributed(limiter) => limiter.acquire(cost).await,
        }
    }

    pub fn limits(&self) -> BucketLimits {
        match self {
            ServiceLimiter::Local(limiter) => limiter.limits(),
            ServiceLimiter::Distributed(limiter) => limiter.limits(),
        }
    }

    /// Callers suspended in `acquire`; always zero for the distributed variant
    pub fn pending_waiters(&self) -> usize {
        match self {
            ServiceLimiter::Local(limiter) => limiter.pending_waiters(),
            ServiceLimiter::Distributed(_) => 0,
        }
    }
}

/// One limiter per external service
#[derive(Debug, Clone)]
pub struct ServiceRateLimiters {
    limiters: HashMap<ExternalService, Arc<ServiceLimiter>>,
}

impl ServiceRateLimiters {
    /// Build limiters from configuration. Distributed mode needs a store.
    pub fn from_settings(
        settings: &RateLimitSettings,
        store: Option<Arc<dyn TokenStore>>,
    ) -> AppResult<Self> {
        let mut limiters = HashMap::new();

        for service in ExternalService::ALL {
            let rate = match service {
                ExternalService::Language => settings.language,
                ExternalService::Image => settings.image,
                ExternalService::Speech => settings.speech,
            };
            let limits = BucketLimits::new(rate.rate_per_second, rate.burst)?;

            let limiter = match settings.mode {
                RateLimitMode::Local => {
                    ServiceLimiter::Local(RateLimiter::from_limits(&service.to_string(), limits)?)
                }
                RateLimitMode::Distributed => {
                    let store = store.clone().ok_or_else(|| {
                        AppError::ConfigurationError(
                            "distributed rate limiting requires a shared token store".to_string(),
                        )
                    })?;
                    ServiceLimiter::Distributed(DistributedRateLimiter::new(
                        service.bucket_key(),
                        limits,
                        store,
                        settings.max_wait,
                    ))
                }
            };

            log_info!(
                "Rate limiter for {}: {}/s, burst {} ({:?})",
                service,
                limits.rate_per_second,
                limits.burst,
                settings.mode
            );
            limiters.insert(service, Arc::new(limiter));
        }

        Ok(Self { limiters })
    }

    /// Same local rate for every service; handy for tests and tools
    pub fn uniform(rate: ServiceRate) -> AppResult<Self> {
        let mut limiters = HashMap::new();
        for service in ExternalService::ALL {
            let limiter =
                RateLimiter::configure(&service.to_string(), rate.rate_per_second, rate.burst)?;
            limiters.insert(service, Arc::new(ServiceLimiter::Local(limiter)));
        }
        Ok(Self { limiters })
    }

    pub fn with_limiter(mut self, service: ExternalService, limiter: ServiceLimiter) -> Self {
        self.limiters.insert(service, Arc::new(limiter));
        self
    }

    pub async fn acquire(&self, service: ExternalService, cost: u32) -> AppResult<()> {
        self.get(service)?.acquire(cost).await
    }

    pub fn get(&self, service: ExternalService) -> AppResult<&ServiceLimiter> {
        self.limiters
            .get(&service)
            .map(|l| l.as_ref())
            .ok_or_else(|| {
                AppError::ConfigurationError(format!("no rate limiter configured for {}", service))
            })
    }
}
