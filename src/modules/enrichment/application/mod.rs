pub mod batch_processor;
pub mod handler;
pub mod pipeline;
pub mod reference_cache;
pub mod service;

pub use batch_processor::{BatchConfig, BatchProcessor, BatchSummary};
pub use handler::EnrichmentJobHandler;
pub use pipeline::{
    EnrichmentPipeline, EnrichmentReport, EnrichmentRequest, Prefetch, Prefetched, Stage,
    StageOutcome, StageReport,
};
pub use reference_cache::{CacheStats, ReferenceCache};
pub use service::{EnrichmentRequestOptions, EnrichmentService};
