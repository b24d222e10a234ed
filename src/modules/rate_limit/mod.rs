/// Per-service rate limiting for external collaborators
///
/// - Domain: pure token bucket, service keys and the shared token store port
/// - `limiter`: in-process limiter on top of governor
/// - `distributed`: limiter over a shared `TokenStore`
/// - `registry`: one limiter per external service, built from configuration
pub mod distributed;
pub mod domain;
pub mod infrastructure;
pub mod limiter;
pub mod registry;

pub use distributed::DistributedRateLimiter;
pub use domain::{BucketLimits, ExternalService, TokenBucket, TokenStore};
pub use infrastructure::InMemoryTokenStore;
pub use limiter::RateLimiter;
pub use registry::{ServiceLimiter, ServiceRateLimiters};
