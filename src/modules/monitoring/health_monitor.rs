use crate::modules::jobs::domain::entities::JobRecord;
use crate::modules::jobs::domain::repository::JobStore;
use crate::modules::jobs::worker::WorkerObserver;
use crate::shared::errors::AppError;
use crate::shared::utils::clock::{to_chrono, Clock, SharedClock};
use crate::{log_debug, log_error, log_warn};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Liveness record kept per worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub name: String,
    pub last_heartbeat: DateTime<Utc>,
    pub healthy: bool,
    pub processed_count: u64,
    pub failed_count: u64,
    /// Failures that exhausted their attempts
    pub terminal_failures: u64,
    pub fatal_error: Option<String>,
}

impl WorkerHealth {
    fn new(name: &str, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            last_heartbeat: now,
            healthy: true,
            processed_count: 0,
            failed_count: 0,
            terminal_failures: 0,
            fatal_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub backend_connected: bool,
    pub checked_at: DateTime<Utc>,
    pub workers: Vec<WorkerHealth>,
}

/// Aggregates worker heartbeats and job outcomes.
///
/// Pass it to each `Worker` as an observer. The self-ping keeps heartbeats
/// fresh while workers sit idle, as long as the job store answers.
pub struct HealthMonitor {
    clock: SharedClock,
    store: Arc<dyn JobStore>,
    workers: DashMap<String, WorkerHealth>,
    backend_connected: AtomicBool,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn JobStore>, clock: SharedClock) -> Self {
        Self {
            clock,
            store,
            workers: DashMap::new(),
            backend_connected: AtomicBool::new(true),
        }
    }

    /// Start tracking a worker; re-registering clears a previous fatal error
    pub fn register(&self, worker: &str) {
        let now = self.clock.now();
        self.workers
            .insert(worker.to_string(), WorkerHealth::new(worker, now));
        log_debug!("Health monitor tracking worker {}", worker);
    }

    pub fn heartbeat(&self, worker: &str) {
        self.update(worker, |_| {});
    }

    /// Mark a worker unhealthy until it registers again
    pub fn record_fatal(&self, worker: &str, error: &AppError) {
        log_error!("Worker {} hit a fatal error: {}", worker, error);
        self.update(worker, |record| {
            record.fatal_error = Some(error.to_string());
            record.healthy = false;
        });
    }

    /// Heartbeat within `max_age` and no fatal error
    pub fn is_healthy(&self, worker: &str, max_age: Duration) -> bool {
        let now = self.clock.now();
        self.workers
            .get(worker)
            .map_or(false, |record| Self::evaluate(&record, now, max_age))
    }

    pub fn worker(&self, worker: &str) -> Option<WorkerHealth> {
        self.workers.get(worker).map(|record| record.clone())
    }

    /// Ask the job store whether it is reachable. A successful ping counts as
    /// a heartbeat for every registered worker.
    pub async fn ping_backend(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => {
                self.backend_connected.store(true, Ordering::SeqCst);
                let now = self.clock.now();
                for mut record in self.workers.iter_mut() {
                    record.last_heartbeat = now;
                }
                true
            }
            Err(e) => {
                if self.backend_connected.swap(false, Ordering::SeqCst) {
                    log_warn!("Job store backend unreachable: {}", e);
                }
                false
            }
        }
    }

    pub fn start_self_ping(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        monitor.ping_backend().await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Aggregate status for the health endpoint; pings the backend first
    pub async fn health_report(&self, max_age: Duration) -> HealthReport {
        let backend_connected = self.ping_backend().await;
        let now = self.clock.now();

        let mut workers: Vec<WorkerHealth> = self
            .workers
            .iter()
            .map(|record| {
                let mut health = record.clone();
                health.healthy = Self::evaluate(&record, now, max_age);
                health
            })
            .collect();
        workers.sort_by(|a, b| a.name.cmp(&b.name));

        let status = if backend_connected && workers.iter().all(|w| w.healthy) {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            backend_connected,
            checked_at: now,
            workers,
        }
    }

    fn evaluate(record: &WorkerHealth, now: DateTime<Utc>, max_age: Duration) -> bool {
        record.fatal_error.is_none() && now - record.last_heartbeat <= to_chrono(max_age)
    }

    fn update<F: FnOnce(&mut WorkerHealth)>(&self, worker: &str, change: F) {
        let now = self.clock.now();
        let mut record = self
            .workers
            .entry(worker.to_string())
            .or_insert_with(|| WorkerHealth::new(worker, now));
        record.last_heartbeat = now;
        change(&mut record);
    }

    /// Errors that mean the worker cannot make progress on its own
    fn is_fatal(error: &AppError) -> bool {
        matches!(
            error,
            AppError::ConfigurationError(_) | AppError::InternalError(_)
        )
    }
}

impl WorkerObserver for HealthMonitor {
    fn on_active(&self, worker: &str, _job: &JobRecord) {
        self.heartbeat(worker);
    }

    fn on_completed(&self, worker: &str, _job: &JobRecord, _result: &serde_json::Value) {
        self.update(worker, |record| record.processed_count += 1);
    }

    fn on_failed(&self, worker: &str, job: &JobRecord, error: &AppError, terminal: bool) {
        self.update(worker, |record| {
            record.failed_count += 1;
            if terminal {
                record.terminal_failures += 1;
            }
        });
        if terminal {
            log_warn!(
                "Job {} on queue '{}' failed permanently: {}",
                job.id,
                job.queue,
                error
            );
        }
    }

    fn on_error(&self, worker: &str, error: &AppError) {
        if Self::is_fatal(error) {
            self.record_fatal(worker, error);
        } else {
            log_debug!("Worker {} reported: {}", worker, error);
        }
    }

    fn on_idle(&self, worker: &str) {
        self.heartbeat(worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::jobs::infrastructure::InMemoryJobStore;
    use crate::shared::utils::clock::ManualClock;

    fn monitor() -> (HealthMonitor, InMemoryJobStore, ManualClock) {
        let clock = ManualClock::default();
        let store = InMemoryJobStore::with_clock(Arc::new(clock.clone()));
        let monitor = HealthMonitor::new(Arc::new(store.clone()), Arc::new(clock.clone()));
        (monitor, store, clock)
    }

    #[test]
    fn test_heartbeat_ages_out() {
        let (monitor, _, clock) = monitor();
        monitor.register("w1");
        assert!(monitor.is_healthy("w1", Duration::from_secs(60)));

        clock.advance(Duration::from_secs(61));
        assert!(!monitor.is_healthy("w1", Duration::from_secs(60)));

        monitor.on_idle("w1");
        assert!(monitor.is_healthy("w1", Duration::from_secs(60)));
    }

    #[test]
    fn test_unknown_worker_is_unhealthy() {
        let (monitor, _, _) = monitor();
        assert!(!monitor.is_healthy("ghost", Duration::from_secs(60)));
    }

    #[test]
    fn test_fatal_error_marks_unhealthy_until_reregistered() {
        let (monitor, _, _) = monitor();
        monitor.register("w1");

        monitor.on_error("w1", &AppError::RateLimitExceeded("busy".to_string()));
        assert!(monitor.is_healthy("w1", Duration::from_secs(60)));

        monitor.on_error("w1", &AppError::ConfigurationError("bad".to_string()));
        assert!(!monitor.is_healthy("w1", Duration::from_secs(60)));

        monitor.register("w1");
        assert!(monitor.is_healthy("w1", Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_self_ping_refreshes_idle_workers() {
        let (monitor, _, clock) = monitor();
        monitor.register("w1");
        clock.advance(Duration::from_secs(300));

        assert!(monitor.ping_backend().await);
        assert!(monitor.is_healthy("w1", Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_report_degrades_when_backend_down() {
        let (monitor, store, _) = monitor();
        monitor.register("w1");

        let report = monitor.health_report(Duration::from_secs(60)).await;
        assert_eq!(report.status, HealthStatus::Ok);

        store.set_reachable(false);
        let report = monitor.health_report(Duration::from_secs(60)).await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(!report.backend_connected);
    }
}
