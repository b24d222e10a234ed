//! Queue names shared by producers and workers

/// Full enrichment runs
pub const ENRICHMENT: &str = "enrichment";

/// Rich-insight regeneration only
pub const INSIGHTS: &str = "insights";
