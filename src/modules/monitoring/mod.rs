/// Worker liveness tracking for the health endpoint
pub mod health_monitor;

pub use health_monitor::{HealthMonitor, HealthReport, HealthStatus, WorkerHealth};
