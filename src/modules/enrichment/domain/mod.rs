pub mod complexity;
pub mod confusion;
pub mod dictionary;
pub mod entity;
pub mod insights;

pub use complexity::ComplexityMetrics;
pub use confusion::{filter_confusions, ConfusionEntry, DEFAULT_CONFUSION_LIMIT};
pub use dictionary::{choose_entry, DictionaryEntry};
pub use entity::{EnrichableEntity, MediaKind, MediaRef};
pub use insights::{CommonErrors, Etymology, LearningTips, Mnemonics, RichInsights, Usage};
