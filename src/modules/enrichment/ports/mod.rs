pub mod collaborators;
pub mod entity_repository;
pub mod media_store;

pub use collaborators::{
    AudioSynthesizer, CollaboratorContext, Collaborators, ConfusionAnalyzer, DictionaryLookup,
    GeneratedMedia, ImageGenerator, InsightGenerator, Interpretation, Interpreter,
};
pub use entity_repository::EntityRepository;
pub use media_store::{ExistingMedia, MediaStore};
