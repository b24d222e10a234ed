use super::complexity::ComplexityMetrics;
use super::confusion::ConfusionEntry;
use super::insights::RichInsights;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Image => write!(f, "image"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaKind::Image),
            "audio" => Ok(MediaKind::Audio),
            _ => Err(format!("Invalid media kind: {}", s)),
        }
    }
}

/// Pointer to a generated asset shared by every entity with the same key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub key: String,
    pub uri: String,
    pub content_type: String,
}

/// A flashcard headword and everything the pipeline has learned about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichableEntity {
    pub id: Uuid,
    pub key: String,
    pub pronunciation: Option<String>,
    pub gloss: Option<String>,
    pub complexity: Option<ComplexityMetrics>,
    pub confusions: Option<Vec<ConfusionEntry>>,
    pub image: Option<MediaRef>,
    pub audio: Option<MediaRef>,
    pub insights: Option<RichInsights>,
    pub insights_generated_at: Option<DateTime<Utc>>,
    /// No automatic re-enrichment needed; independent of `has_insights`
    pub cached: bool,
    pub updated_at: DateTime<Utc>,
}

impl EnrichableEntity {
    pub fn new(key: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.trim().to_string(),
            pronunciation: None,
            gloss: None,
            complexity: None,
            confusions: None,
            image: None,
            audio: None,
            insights: None,
            insights_generated_at: None,
            cached: false,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn has_pronunciation(&self) -> bool {
        non_blank(&self.pronunciation)
    }

    pub fn has_gloss(&self) -> bool {
        non_blank(&self.gloss)
    }

    /// Insights are present and pass validation
    pub fn has_insights(&self) -> bool {
        self.insights
            .as_ref()
            .map_or(false, |insights| insights.is_valid())
    }

    pub fn media(&self, kind: MediaKind) -> Option<&MediaRef> {
        match kind {
            MediaKind::Image => self.image.as_ref(),
            MediaKind::Audio => self.audio.as_ref(),
        }
    }

    pub fn set_media(&mut self, media: MediaRef) {
        match media.kind {
            MediaKind::Image => self.image = Some(media),
            MediaKind::Audio => self.audio = Some(media),
        }
    }

    /// Every field the pipeline fills is present and valid
    pub fn is_complete(&self) -> bool {
        self.has_pronunciation()
            && self.has_gloss()
            && self.complexity.is_some()
            && self.confusions.is_some()
            && self.image.is_some()
            && self.audio.is_some()
            && self.has_insights()
    }
}

fn non_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(false, |v| !v.trim().is_empty())
}
