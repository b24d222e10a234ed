/// Flashcard enrichment module
///
/// Fills in an entity's pronunciation, gloss, complexity, confusable
/// characters, image, audio and rich insights by calling external
/// collaborators through rate limiters.
///
/// Architecture:
/// - Domain: the entity aggregate and pure analysis (dictionary choice,
///   complexity scoring, confusion filtering, insight validation)
/// - Ports: collaborator, repository and media store traits
/// - Application: the staged pipeline, batch processor, job handler and
///   submission service
/// - Infrastructure: HTTP gateway, in-memory and filesystem stores, Postgres
///   repository
pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod ports;

// Re-exports for easy access
pub use application::{
    BatchConfig, BatchProcessor, BatchSummary, EnrichmentJobHandler, EnrichmentPipeline,
    EnrichmentReport, EnrichmentRequest, EnrichmentRequestOptions, EnrichmentService, Stage,
    StageOutcome,
};
pub use domain::{EnrichableEntity, MediaKind, MediaRef, RichInsights};
pub use ports::{Collaborators, EntityRepository, MediaStore};
