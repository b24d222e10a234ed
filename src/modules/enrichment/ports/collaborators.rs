//! External AI and media collaborators.
//!
//! Each port is one async call taking the entity key plus whatever context
//! the pipeline has gathered so far; adapters own the wire format.

use crate::modules::enrichment::domain::{ConfusionEntry, DictionaryEntry, RichInsights};
use crate::shared::errors::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// What the pipeline knows about an entity when it calls out
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorContext {
    pub entity_id: Uuid,
    pub user_id: Option<String>,
    /// Preferred provider, passed through untouched
    pub provider: Option<String>,
    pub pronunciation: Option<String>,
    pub gloss: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interpretation {
    pub pronunciation: String,
    pub gloss: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedMedia {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DictionaryLookup: Send + Sync {
    async fn lookup(&self, key: &str) -> AppResult<Vec<DictionaryEntry>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn interpret(&self, key: &str, context: &CollaboratorContext)
        -> AppResult<Interpretation>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfusionAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        key: &str,
        context: &CollaboratorContext,
    ) -> AppResult<Vec<ConfusionEntry>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate_image(
        &self,
        key: &str,
        context: &CollaboratorContext,
    ) -> AppResult<GeneratedMedia>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioSynthesizer: Send + Sync {
    async fn synthesize(&self, key: &str, context: &CollaboratorContext)
        -> AppResult<GeneratedMedia>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InsightGenerator: Send + Sync {
    async fn generate_insights(
        &self,
        key: &str,
        context: &CollaboratorContext,
    ) -> AppResult<RichInsights>;
}

/// The full set of collaborators one pipeline talks to
#[derive(Clone)]
pub struct Collaborators {
    pub dictionary: Arc<dyn DictionaryLookup>,
    pub interpreter: Arc<dyn Interpreter>,
    pub confusion: Arc<dyn ConfusionAnalyzer>,
    pub image: Arc<dyn ImageGenerator>,
    pub audio: Arc<dyn AudioSynthesizer>,
    pub insights: Arc<dyn InsightGenerator>,
}

impl Collaborators {
    /// One adapter serving every port, e.g. the HTTP gateway
    pub fn from_gateway<G>(gateway: Arc<G>) -> Self
    where
        G: DictionaryLookup
            + Interpreter
            + ConfusionAnalyzer
            + ImageGenerator
            + AudioSynthesizer
            + InsightGenerator
            + 'static,
    {
        Self {
            dictionary: gateway.clone(),
            interpreter: gateway.clone(),
            confusion: gateway.clone(),
            image: gateway.clone(),
            audio: gateway.clone(),
            insights: gateway,
        }
    }
}
