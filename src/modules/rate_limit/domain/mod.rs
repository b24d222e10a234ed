pub mod service;
pub mod token_bucket;
pub mod token_store;

pub use service::ExternalService;
pub use token_bucket::{default_burst, BucketLimits, TokenBucket};
pub use token_store::TokenStore;
