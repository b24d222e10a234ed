//! Structured study notes produced by the insight generator.
//!
//! Generators are free to leave optional parts out, so every field
//! deserializes with a default; `validate` decides whether the result is
//! good enough to keep.

use crate::shared::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Etymology {
    pub origin: String,
    pub evolution: Vec<String>,
    pub components: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mnemonics {
    pub visual: String,
    pub story: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonErrors {
    pub similar_characters: Vec<String>,
    pub wrong_contexts: Vec<String>,
    pub tone_confusions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub collocations: Vec<String>,
    pub register: Option<String>,
    pub examples: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningTips {
    pub for_beginners: Vec<String>,
    pub for_intermediate: Vec<String>,
    pub for_advanced: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RichInsights {
    pub etymology: Etymology,
    pub mnemonics: Mnemonics,
    pub common_errors: CommonErrors,
    pub usage: Usage,
    pub learning_tips: LearningTips,
}

impl RichInsights {
    /// Required leaves: etymology origin, visual mnemonic and at least one
    /// beginner tip, none of them blank.
    pub fn validate(&self) -> AppResult<()> {
        let mut missing = Vec::new();

        if self.etymology.origin.trim().is_empty() {
            missing.push("etymology.origin");
        }
        if self.mnemonics.visual.trim().is_empty() {
            missing.push("mnemonics.visual");
        }
        if !self
            .learning_tips
            .for_beginners
            .iter()
            .any(|tip| !tip.trim().is_empty())
        {
            missing.push("learning_tips.for_beginners");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::ValidationError(format!(
                "insights missing required fields: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}
