/// Scripted collaborators that count every call
use super::factories::valid_insights;
use async_trait::async_trait;
use hanzi_enrichment::modules::enrichment::domain::{
    ConfusionEntry, DictionaryEntry, MediaKind, MediaRef, RichInsights,
};
use hanzi_enrichment::modules::enrichment::infrastructure::InMemoryMediaStore;
use hanzi_enrichment::modules::enrichment::ports::{
    AudioSynthesizer, CollaboratorContext, ConfusionAnalyzer, DictionaryLookup, ExistingMedia,
    GeneratedMedia, ImageGenerator, InsightGenerator, Interpretation, Interpreter, MediaStore,
};
use hanzi_enrichment::shared::{AppError, AppResult};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct CallCounts {
    pub dictionary: AtomicUsize,
    pub interpret: AtomicUsize,
    pub confusion: AtomicUsize,
    pub image: AtomicUsize,
    pub audio: AtomicUsize,
    pub insights: AtomicUsize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        [
            &self.dictionary,
            &self.interpret,
            &self.confusion,
            &self.image,
            &self.audio,
            &self.insights,
        ]
        .iter()
        .map(|count| count.load(Ordering::SeqCst))
        .sum()
    }
}

/// One object standing in for every collaborator port.
///
/// Unknown keys get an empty dictionary answer, a made-up interpretation
/// and valid insights.
#[derive(Default)]
pub struct FakeCollaborators {
    pub calls: CallCounts,
    dictionary: Mutex<HashMap<String, Vec<DictionaryEntry>>>,
    interpretations: Mutex<HashMap<String, Interpretation>>,
    confusions: Mutex<HashMap<String, Vec<ConfusionEntry>>>,
    insights: Mutex<HashMap<String, RichInsights>>,
    failing_entities: Mutex<HashSet<Uuid>>,
    gates: Mutex<HashMap<&'static str, Arc<Semaphore>>>,
}

impl FakeCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dictionary(self, key: &str, entries: Vec<DictionaryEntry>) -> Self {
        lock(&self.dictionary).insert(key.to_string(), entries);
        self
    }

    pub fn with_interpretation(self, key: &str, pronunciation: &str, gloss: &str) -> Self {
        lock(&self.interpretations).insert(
            key.to_string(),
            Interpretation {
                pronunciation: pronunciation.to_string(),
                gloss: gloss.to_string(),
            },
        );
        self
    }

    pub fn with_confusions(self, key: &str, candidates: Vec<ConfusionEntry>) -> Self {
        lock(&self.confusions).insert(key.to_string(), candidates);
        self
    }

    pub fn with_insights(self, key: &str, insights: RichInsights) -> Self {
        lock(&self.insights).insert(key.to_string(), insights);
        self
    }

    /// Interpretation fails for this entity, whatever its key
    pub fn fail_interpretation_for(&self, entity_id: Uuid) {
        lock(&self.failing_entities).insert(entity_id);
    }

    /// Calls named `call` ("image", "insights", ...) block after being
    /// counted until the returned gate gets a permit
    pub fn hold(&self, call: &'static str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        lock(&self.gates).insert(call, gate.clone());
        gate
    }

    async fn pass_gate(&self, call: &'static str) {
        let gate = lock(&self.gates).get(call).cloned();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }
    }

    pub fn dictionary_calls(&self) -> usize {
        self.calls.dictionary.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.total()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl DictionaryLookup for FakeCollaborators {
    async fn lookup(&self, key: &str) -> AppResult<Vec<DictionaryEntry>> {
        self.calls.dictionary.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.dictionary).get(key).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl Interpreter for FakeCollaborators {
    async fn interpret(
        &self,
        key: &str,
        context: &CollaboratorContext,
    ) -> AppResult<Interpretation> {
        self.calls.interpret.fetch_add(1, Ordering::SeqCst);
        if lock(&self.failing_entities).contains(&context.entity_id) {
            return Err(AppError::ExternalServiceError(
                "interpreter unavailable".to_string(),
            ));
        }
        Ok(lock(&self.interpretations)
            .get(key)
            .cloned()
            .unwrap_or_else(|| Interpretation {
                pronunciation: "ce4".to_string(),
                gloss: format!("meaning of {}", key),
            }))
    }
}

#[async_trait]
impl ConfusionAnalyzer for FakeCollaborators {
    async fn analyze(
        &self,
        key: &str,
        _context: &CollaboratorContext,
    ) -> AppResult<Vec<ConfusionEntry>> {
        self.calls.confusion.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.confusions).get(key).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ImageGenerator for FakeCollaborators {
    async fn generate_image(
        &self,
        key: &str,
        _context: &CollaboratorContext,
    ) -> AppResult<GeneratedMedia> {
        self.calls.image.fetch_add(1, Ordering::SeqCst);
        self.pass_gate("image").await;
        Ok(GeneratedMedia {
            bytes: format!("image of {}", key).into_bytes(),
            content_type: "image/png".to_string(),
        })
    }
}

#[async_trait]
impl AudioSynthesizer for FakeCollaborators {
    async fn synthesize(
        &self,
        key: &str,
        _context: &CollaboratorContext,
    ) -> AppResult<GeneratedMedia> {
        self.calls.audio.fetch_add(1, Ordering::SeqCst);
        Ok(GeneratedMedia {
            bytes: format!("audio of {}", key).into_bytes(),
            content_type: "audio/mpeg".to_string(),
        })
    }
}

#[async_trait]
impl InsightGenerator for FakeCollaborators {
    async fn generate_insights(
        &self,
        key: &str,
        _context: &CollaboratorContext,
    ) -> AppResult<RichInsights> {
        self.calls.insights.fetch_add(1, Ordering::SeqCst);
        self.pass_gate("insights").await;
        Ok(lock(&self.insights)
            .get(key)
            .cloned()
            .unwrap_or_else(|| valid_insights(key)))
    }
}

/// In-memory media store that counts existence checks and writes
#[derive(Default)]
pub struct CountingMediaStore {
    pub inner: InMemoryMediaStore,
    pub existence_checks: AtomicUsize,
    pub writes: AtomicUsize,
}

impl CountingMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checks(&self) -> usize {
        self.existence_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaStore for CountingMediaStore {
    async fn find_existing(&self, key: &str) -> AppResult<ExistingMedia> {
        self.existence_checks.fetch_add(1, Ordering::SeqCst);
        self.inner.find_existing(key).await
    }

    async fn store(
        &self,
        key: &str,
        kind: MediaKind,
        media: GeneratedMedia,
    ) -> AppResult<MediaRef> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.store(key, kind, media).await
    }
}
