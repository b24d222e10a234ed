use log::{debug, info, LevelFilter};
use std::sync::Once;

static INIT: Once = Once::new();

/// Set up env_logger once per process.
///
/// `RUST_LOG` still wins over the defaults below.
pub fn init_logger() {
    INIT.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Info)
            .filter_module("hanzi_enrichment", LevelFilter::Debug)
            .filter_module("enrichment_worker", LevelFilter::Debug)
            .filter_module("diesel", LevelFilter::Warn)
            .filter_module("reqwest", LevelFilter::Warn)
            .filter_module("hyper", LevelFilter::Warn)
            .filter_module("governor", LevelFilter::Warn)
            .parse_default_env()
            .format_timestamp_millis()
            .format_module_path(false)
            .init();

        info!("Logger ready");
    });
}

/// Macro for structured logging with context
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        log::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        log::debug!($($arg)*)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        log::warn!($($arg)*)
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        log::error!($($arg)*)
    };
}

/// One-line log shapes shared by the queue, the pipeline and the batch loop
pub struct LogContext;

impl LogContext {
    /// A finished call to a collaborator; `None` marks the start of one
    pub fn external_call(service: &str, key: &str, status: &str, duration_ms: Option<u64>) {
        match duration_ms {
            Some(ms) => info!("[{}] '{}' -> {} ({}ms)", service, key, status, ms),
            None => debug!("[{}] '{}' -> calling", service, key),
        }
    }

    pub fn job_transition(queue: &str, job_id: &uuid::Uuid, from: &str, to: &str) {
        debug!("[queue {}] job {}: {} -> {}", queue, job_id, from, to);
    }

    pub fn batch_progress(done: usize, total: usize, job_id: &str) {
        debug!("[batch] {}/{} settled (job {})", done, total, job_id);
    }

    pub fn performance_metric(operation: &str, duration_ms: u64, note: Option<&str>) {
        match note {
            Some(note) => info!("{} took {}ms; {}", operation, duration_ms, note),
            None => info!("{} took {}ms", operation, duration_ms),
        }
    }
}

/// Logs how long an operation took when finished
pub struct TimedOperation {
    started: std::time::Instant,
    label: String,
}

impl TimedOperation {
    pub fn new(label: &str) -> Self {
        debug!("{} started", label);
        Self {
            started: std::time::Instant::now(),
            label: label.to_string(),
        }
    }

    pub fn finish(self) -> u64 {
        let ms = self.started.elapsed().as_millis() as u64;
        LogContext::performance_metric(&self.label, ms, None);
        ms
    }

    pub fn finish_with_info(self, note: &str) -> u64 {
        let ms = self.started.elapsed().as_millis() as u64;
        LogContext::performance_metric(&self.label, ms, Some(note));
        ms
    }
}
