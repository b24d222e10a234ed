pub mod enrichment;
pub mod jobs;
pub mod monitoring;
pub mod rate_limit;
