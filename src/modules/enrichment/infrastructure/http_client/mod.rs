pub mod gateway;
pub mod retry_policy;

pub use gateway::{CollaboratorEndpoints, HttpCollaboratorGateway};
pub use retry_policy::{RateLimitInfo, RetryPolicy};
