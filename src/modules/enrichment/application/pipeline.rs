//! Per-entity enrichment state machine.
//!
//! Stages run in a fixed order and each one is skipped when its output is
//! already present (unless the request is forced). The entity is saved after
//! every stage that changed it, so a crash or lost lock never throws away
//! the stages that already finished.

use super::reference_cache::ReferenceCache;
use crate::modules::enrichment::domain::{
    choose_entry, complexity, filter_confusions, DictionaryEntry, EnrichableEntity, MediaKind,
    MediaRef, DEFAULT_CONFUSION_LIMIT,
};
use crate::modules::enrichment::ports::{
    CollaboratorContext, Collaborators, EntityRepository, ExistingMedia, Interpretation,
    MediaStore,
};
use crate::modules::jobs::domain::entities::{
    EnrichEntityPayload, JobProgress, RefreshInsightsPayload,
};
use crate::modules::jobs::domain::lease::{LeaseGuard, ProgressReporter};
use crate::modules::rate_limit::{ExternalService, ServiceRateLimiters};
use crate::shared::errors::{AppError, AppResult};
use crate::shared::utils::clock::{Clock, SharedClock};
use crate::shared::utils::logger::{LogContext, TimedOperation};
use crate::{log_debug, log_error, log_info, log_warn};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// How long a freshly generated asset is remembered in-process
const RECENT_MEDIA_TTL: Duration = Duration::from_secs(600);
const RECENT_MEDIA_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Lexical,
    Interpretation,
    Complexity,
    Confusion,
    Image,
    Audio,
    Insights,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Lexical,
        Stage::Interpretation,
        Stage::Complexity,
        Stage::Confusion,
        Stage::Image,
        Stage::Audio,
        Stage::Insights,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Lexical => "lexical",
            Stage::Interpretation => "interpretation",
            Stage::Complexity => "complexity",
            Stage::Confusion => "confusion",
            Stage::Image => "image",
            Stage::Audio => "audio",
            Stage::Insights => "insights",
        }
    }

    /// 1-based position, used for progress counts
    pub fn position(&self) -> u32 {
        Self::ALL
            .iter()
            .position(|stage| stage == self)
            .map_or(0, |index| index as u32 + 1)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    /// Output already present
    Skipped,
    /// Ran, but the source had nothing to offer; later stages cover it
    NoData,
    Failed(String),
    /// Output arrived but failed validation and was thrown away
    Discarded(String),
}

impl StageOutcome {
    /// Counts toward marking the entity as cached
    pub fn is_acceptable(&self) -> bool {
        matches!(
            self,
            StageOutcome::Completed | StageOutcome::Skipped | StageOutcome::NoData
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub outcome: StageOutcome,
}

/// Stored as the job result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentReport {
    pub entity_id: Uuid,
    pub key: String,
    pub stages: Vec<StageReport>,
    pub cached: bool,
    pub has_insights: bool,
    pub external_calls: u32,
}

impl EnrichmentReport {
    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|report| report.stage == stage)
            .map(|report| &report.outcome)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentRequest {
    pub entity_id: Uuid,
    pub user_id: Option<String>,
    pub force: bool,
    pub provider: Option<String>,
}

impl From<EnrichEntityPayload> for EnrichmentRequest {
    fn from(payload: EnrichEntityPayload) -> Self {
        Self {
            entity_id: payload.entity_id,
            user_id: payload.user_id,
            force: payload.force,
            provider: payload.provider,
        }
    }
}

impl From<RefreshInsightsPayload> for EnrichmentRequest {
    fn from(payload: RefreshInsightsPayload) -> Self {
        Self {
            entity_id: payload.entity_id,
            user_id: payload.user_id,
            force: true,
            provider: None,
        }
    }
}

/// Data a batch looked up ahead of time
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Prefetch<T> {
    #[default]
    NotFetched,
    Fetched(T),
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prefetched {
    pub dictionary: Prefetch<Vec<DictionaryEntry>>,
    pub media: Prefetch<ExistingMedia>,
}

/// Which entity fields a run owns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunScope {
    Full,
    /// Insight fields and the cached flag only
    Insights,
}

/// Mutable state of one pipeline run
struct Run<'a> {
    scope: RunScope,
    entity: EnrichableEntity,
    request: &'a EnrichmentRequest,
    lease: &'a LeaseGuard,
    progress: &'a dyn ProgressReporter,
    stages: Vec<StageReport>,
    external_calls: u32,
    /// Pronunciation or gloss changed during this run
    identity_changed: bool,
    insights_written: bool,
    /// Set once the final cached flag is known
    cached_verdict: Option<bool>,
}

impl<'a> Run<'a> {
    fn new(
        entity: EnrichableEntity,
        request: &'a EnrichmentRequest,
        lease: &'a LeaseGuard,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            scope: RunScope::Full,
            entity,
            request,
            lease,
            progress,
            stages: Vec::with_capacity(Stage::ALL.len()),
            external_calls: 0,
            identity_changed: false,
            insights_written: false,
            cached_verdict: None,
        }
    }

    fn insights_only(mut self) -> Self {
        self.scope = RunScope::Insights;
        self
    }

    fn force(&self) -> bool {
        self.request.force
    }

    fn record(&mut self, stage: Stage, outcome: StageOutcome) {
        log_debug!("Entity '{}' stage {}: {:?}", self.entity.key, stage, outcome);
        self.stages.push(StageReport { stage, outcome });
    }

    fn context(&self) -> CollaboratorContext {
        CollaboratorContext {
            entity_id: self.entity.id,
            user_id: self.request.user_id.clone(),
            provider: self.request.provider.clone(),
            pronunciation: self.entity.pronunciation.clone(),
            gloss: self.entity.gloss.clone(),
        }
    }
}

pub struct EnrichmentPipeline {
    repository: Arc<dyn EntityRepository>,
    collaborators: Collaborators,
    media: Arc<dyn MediaStore>,
    limiters: ServiceRateLimiters,
    clock: SharedClock,
    media_locks: DashMap<String, Arc<Mutex<()>>>,
    recent_media: ReferenceCache<MediaRef>,
    confusion_limit: usize,
}

impl EnrichmentPipeline {
    pub fn new(
        repository: Arc<dyn EntityRepository>,
        collaborators: Collaborators,
        media: Arc<dyn MediaStore>,
        limiters: ServiceRateLimiters,
        clock: SharedClock,
    ) -> Self {
        Self {
            repository,
            collaborators,
            media,
            limiters,
            recent_media: ReferenceCache::new(
                clock.clone(),
                RECENT_MEDIA_TTL,
                RECENT_MEDIA_CAPACITY,
            ),
            clock,
            media_locks: DashMap::new(),
            confusion_limit: DEFAULT_CONFUSION_LIMIT,
        }
    }

    pub fn with_confusion_limit(mut self, limit: usize) -> Self {
        self.confusion_limit = limit.max(1);
        self
    }

    /// Load the entity and run every stage
    pub async fn enrich(
        &self,
        request: &EnrichmentRequest,
        lease: &LeaseGuard,
        progress: &dyn ProgressReporter,
    ) -> AppResult<EnrichmentReport> {
        let entity = self.load(request.entity_id).await?;
        self.enrich_entity(entity, request, Prefetched::default(), lease, progress)
            .await
    }

    /// Run every stage against an already-loaded entity
    pub async fn enrich_entity(
        &self,
        entity: EnrichableEntity,
        request: &EnrichmentRequest,
        prefetched: Prefetched,
        lease: &LeaseGuard,
        progress: &dyn ProgressReporter,
    ) -> AppResult<EnrichmentReport> {
        let timer = TimedOperation::new(&format!("enrich '{}'", entity.key));
        let mut run = Run::new(entity, request, lease, progress);

        let lexical_resolved = self.resolve_lexical(&mut run, prefetched.dictionary).await?;
        self.interpret(&mut run, lexical_resolved).await?;
        self.analyze_complexity(&mut run).await?;
        self.analyze_confusions(&mut run).await?;
        self.attach_media(&mut run, MediaKind::Image, &prefetched.media)
            .await?;
        self.attach_media(&mut run, MediaKind::Audio, &prefetched.media)
            .await?;
        self.generate_insights(&mut run).await?;

        let report = self.commit(run).await?;
        timer.finish_with_info(&format!(
            "cached={} external_calls={}",
            report.cached, report.external_calls
        ));
        Ok(report)
    }

    /// Regenerate rich insights only.
    ///
    /// May overlap an enrichment run for the same entity, so every save
    /// writes the insight fields over the latest stored copy.
    pub async fn refresh_insights(
        &self,
        request: &EnrichmentRequest,
        lease: &LeaseGuard,
        progress: &dyn ProgressReporter,
    ) -> AppResult<EnrichmentReport> {
        let entity = self.load(request.entity_id).await?;

        let forced = EnrichmentRequest {
            force: true,
            ..request.clone()
        };
        let mut run = Run::new(entity, &forced, lease, progress).insights_only();
        self.generate_insights(&mut run).await?;
        self.commit(run).await
    }

    async fn load(&self, entity_id: Uuid) -> AppResult<EnrichableEntity> {
        self.repository
            .find_by_id(entity_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("entity {} not found", entity_id)))
    }

    /// Save only while we still own the job
    async fn persist(&self, run: &mut Run<'_>) -> AppResult<()> {
        run.lease.ensure_held()?;
        match run.scope {
            RunScope::Full => {
                if !run.insights_written {
                    self.adopt_newer_insights(run).await?;
                }
                run.entity.updated_at = self.clock.now();
                self.repository.save(&run.entity).await
            }
            RunScope::Insights => {
                let mut latest = self.load(run.entity.id).await?;
                if run.insights_written {
                    latest.insights = run.entity.insights.clone();
                    latest.insights_generated_at = run.entity.insights_generated_at;
                }
                if let Some(cached) = run.cached_verdict {
                    latest.cached = cached;
                }
                latest.updated_at = self.clock.now();
                self.repository.save(&latest).await?;
                run.entity = latest;
                Ok(())
            }
        }
    }

    /// Keep insights a concurrent refresh saved after this run loaded the entity
    async fn adopt_newer_insights(&self, run: &mut Run<'_>) -> AppResult<()> {
        let Some(latest) = self.repository.find_by_id(run.entity.id).await? else {
            return Ok(());
        };
        if latest.insights_generated_at > run.entity.insights_generated_at {
            log_debug!("Keeping insights refreshed meanwhile for '{}'", run.entity.key);
            run.entity.insights = latest.insights;
            run.entity.insights_generated_at = latest.insights_generated_at;
        }
        Ok(())
    }

    async fn announce(&self, run: &Run<'_>, stage: Stage, message: &str) {
        run.progress
            .report(
                JobProgress::new(stage.as_str(), message)
                    .with_counts(stage.position(), Stage::ALL.len() as u32),
            )
            .await;
    }

    /// Record a stage-local failure. Losing the lock is never stage-local.
    fn stage_failed(&self, run: &mut Run<'_>, stage: Stage, error: AppError) -> AppResult<()> {
        if matches!(error, AppError::LockLost(_)) {
            return Err(error);
        }
        log_warn!(
            "Stage {} failed for entity '{}': {}",
            stage,
            run.entity.key,
            error
        );
        run.record(stage, StageOutcome::Failed(error.to_string()));
        Ok(())
    }

    /// Stage 1. Returns true when the dictionary supplied both pronunciation
    /// and gloss.
    async fn resolve_lexical(
        &self,
        run: &mut Run<'_>,
        prefetched: Prefetch<Vec<DictionaryEntry>>,
    ) -> AppResult<bool> {
        let stage = Stage::Lexical;
        if run.entity.has_pronunciation() && run.entity.has_gloss() && !run.force() {
            run.record(stage, StageOutcome::Skipped);
            return Ok(false);
        }
        self.announce(run, stage, "Looking up dictionary").await;

        let lookup = match prefetched {
            Prefetch::Fetched(entries) => Ok(entries),
            Prefetch::Failed(reason) => Err(AppError::ExternalServiceError(reason)),
            Prefetch::NotFetched => {
                run.external_calls += 1;
                self.collaborators.dictionary.lookup(&run.entity.key).await
            }
        };

        let entries = match lookup {
            Ok(entries) => entries,
            Err(e) => {
                self.stage_failed(run, stage, e)?;
                return Ok(false);
            }
        };

        let Some(entry) = choose_entry(&entries) else {
            run.record(stage, StageOutcome::NoData);
            return Ok(false);
        };

        let force = run.force();
        let mut changed = false;
        if let Some(pronunciation) = entry.pronunciation.as_deref().map(str::trim) {
            if !pronunciation.is_empty() && (force || !run.entity.has_pronunciation()) {
                run.entity.pronunciation = Some(pronunciation.to_string());
                changed = true;
            }
        }
        if let Some(gloss) = entry.gloss() {
            if force || !run.entity.has_gloss() {
                run.entity.gloss = Some(gloss);
                changed = true;
            }
        }

        if changed {
            run.identity_changed = true;
            self.persist(run).await?;
            run.record(stage, StageOutcome::Completed);
        } else {
            run.record(stage, StageOutcome::NoData);
        }

        Ok(entry.has_pronunciation() && entry.gloss().is_some())
    }

    /// Stage 2. The only stage whose failure ends the run, unless a gloss
    /// is already available to fall back on.
    async fn interpret(&self, run: &mut Run<'_>, lexical_resolved: bool) -> AppResult<()> {
        let stage = Stage::Interpretation;
        let missing = !(run.entity.has_pronunciation() && run.entity.has_gloss());
        if !missing && !(run.force() && !lexical_resolved) {
            run.record(stage, StageOutcome::Skipped);
            return Ok(());
        }
        self.announce(run, stage, "Interpreting pronunciation and meaning")
            .await;

        let context = run.context();
        let started = Instant::now();
        let interpreted = match self.limiters.acquire(ExternalService::Language, 1).await {
            Ok(()) => {
                run.external_calls += 1;
                self.collaborators
                    .interpreter
                    .interpret(&run.entity.key, &context)
                    .await
                    .and_then(validate_interpretation)
            }
            Err(e) => Err(e),
        };
        log_external(ExternalService::Language, &run.entity.key, &interpreted, started);

        match interpreted {
            Ok(interpretation) => {
                let force = run.force();
                if force || !run.entity.has_pronunciation() {
                    run.entity.pronunciation = Some(interpretation.pronunciation);
                }
                if force || !run.entity.has_gloss() {
                    run.entity.gloss = Some(interpretation.gloss);
                }
                run.identity_changed = true;
                self.persist(run).await?;
                run.record(stage, StageOutcome::Completed);
                Ok(())
            }
            Err(e) if run.entity.has_gloss() && !matches!(e, AppError::LockLost(_)) => {
                log_info!(
                    "Interpretation failed for '{}', keeping existing gloss",
                    run.entity.key
                );
                self.stage_failed(run, stage, e)
            }
            Err(e) => {
                log_error!(
                    "Interpretation failed for '{}' with no gloss to fall back on: {}",
                    run.entity.key,
                    e
                );
                run.record(stage, StageOutcome::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Stage 3, local
    async fn analyze_complexity(&self, run: &mut Run<'_>) -> AppResult<()> {
        let stage = Stage::Complexity;
        if run.entity.complexity.is_some() && !run.force() && !run.identity_changed {
            run.record(stage, StageOutcome::Skipped);
            return Ok(());
        }
        self.announce(run, stage, "Scoring complexity").await;

        let metrics = complexity::analyze(
            &run.entity.key,
            run.entity.pronunciation.as_deref(),
            run.entity.gloss.as_deref(),
        );
        run.entity.complexity = Some(metrics);
        self.persist(run).await?;
        run.record(stage, StageOutcome::Completed);
        Ok(())
    }

    /// Stage 4
    async fn analyze_confusions(&self, run: &mut Run<'_>) -> AppResult<()> {
        let stage = Stage::Confusion;
        if run.entity.confusions.is_some() && !run.force() {
            run.record(stage, StageOutcome::Skipped);
            return Ok(());
        }
        self.announce(run, stage, "Finding confusable entries").await;

        let context = run.context();
        let started = Instant::now();
        let analyzed = match self.limiters.acquire(ExternalService::Language, 1).await {
            Ok(()) => {
                run.external_calls += 1;
                self.collaborators
                    .confusion
                    .analyze(&run.entity.key, &context)
                    .await
            }
            Err(e) => Err(e),
        };
        log_external(ExternalService::Language, &run.entity.key, &analyzed, started);

        match analyzed {
            Ok(candidates) => {
                let filtered = filter_confusions(&run.entity.key, candidates, self.confusion_limit);
                run.entity.confusions = Some(filtered);
                self.persist(run).await?;
                run.record(stage, StageOutcome::Completed);
                Ok(())
            }
            Err(e) => self.stage_failed(run, stage, e),
        }
    }

    /// Stages 5 and 6. Assets are shared by key: link an existing one when
    /// possible, otherwise generate under a per-key lock.
    async fn attach_media(
        &self,
        run: &mut Run<'_>,
        kind: MediaKind,
        prefetched: &Prefetch<ExistingMedia>,
    ) -> AppResult<()> {
        let stage = match kind {
            MediaKind::Image => Stage::Image,
            MediaKind::Audio => Stage::Audio,
        };
        if kind == MediaKind::Audio && !run.entity.has_pronunciation() {
            log_debug!("No pronunciation for '{}', skipping audio", run.entity.key);
            run.record(stage, StageOutcome::Skipped);
            return Ok(());
        }
        if run.entity.media(kind).is_some() && !run.force() {
            run.record(stage, StageOutcome::Skipped);
            return Ok(());
        }
        self.announce(run, stage, &format!("Preparing {}", kind)).await;

        let existing = match prefetched {
            Prefetch::Fetched(media) => Ok(media.get(kind).cloned()),
            Prefetch::Failed(reason) => Err(AppError::ExternalServiceError(reason.clone())),
            Prefetch::NotFetched => self
                .media
                .find_existing(&run.entity.key)
                .await
                .map(|media| media.get(kind).cloned()),
        };

        let linked = match existing {
            Ok(Some(found)) => Ok(found),
            Ok(None) => self.generate_media(run, kind).await,
            Err(e) => Err(e),
        };

        match linked {
            Ok(media) => {
                if run.entity.media(kind) != Some(&media) {
                    run.entity.set_media(media);
                    self.persist(run).await?;
                }
                run.record(stage, StageOutcome::Completed);
                Ok(())
            }
            Err(e) => self.stage_failed(run, stage, e),
        }
    }

    async fn generate_media(&self, run: &mut Run<'_>, kind: MediaKind) -> AppResult<MediaRef> {
        let key = run.entity.key.clone();
        let lock = self
            .media_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.generate_media_locked(run, kind, &key).await
        };

        drop(lock);
        self.media_locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn generate_media_locked(
        &self,
        run: &mut Run<'_>,
        kind: MediaKind,
        key: &str,
    ) -> AppResult<MediaRef> {
        let memo_key = format!("{}:{}", kind, key);
        if let Some(recent) = self.recent_media.get(&memo_key) {
            log_debug!("Reusing {} generated moments ago for '{}'", kind, key);
            return Ok(recent);
        }

        // Another process, or a run whose memo entry has expired, may have
        // stored it since the unlocked check
        if let Some(existing) = self.media.find_existing(key).await?.get(kind).cloned() {
            log_debug!("Linking {} stored meanwhile for '{}'", kind, key);
            self.recent_media.insert(&memo_key, existing.clone());
            return Ok(existing);
        }

        run.lease.ensure_held()?;
        let service = match kind {
            MediaKind::Image => ExternalService::Image,
            MediaKind::Audio => ExternalService::Speech,
        };
        self.limiters.acquire(service, 1).await?;

        let context = run.context();
        let started = Instant::now();
        run.external_calls += 1;
        let generated = match kind {
            MediaKind::Image => self.collaborators.image.generate_image(key, &context).await,
            MediaKind::Audio => self.collaborators.audio.synthesize(key, &context).await,
        };
        log_external(service, key, &generated, started);

        let stored = self.media.store(key, kind, generated?).await?;
        self.recent_media.insert(&memo_key, stored.clone());
        Ok(stored)
    }

    /// Stage 7. Invalid output is discarded, never stored.
    async fn generate_insights(&self, run: &mut Run<'_>) -> AppResult<()> {
        let stage = Stage::Insights;
        if run.entity.has_insights() && !run.force() {
            run.record(stage, StageOutcome::Skipped);
            return Ok(());
        }
        self.announce(run, stage, "Generating study insights").await;

        let context = run.context();
        let started = Instant::now();
        let generated = match self.limiters.acquire(ExternalService::Language, 1).await {
            Ok(()) => {
                run.external_calls += 1;
                self.collaborators
                    .insights
                    .generate_insights(&run.entity.key, &context)
                    .await
            }
            Err(e) => Err(e),
        };
        log_external(ExternalService::Language, &run.entity.key, &generated, started);

        let insights = match generated {
            Ok(insights) => insights,
            Err(e) => return self.stage_failed(run, stage, e),
        };

        if let Err(invalid) = insights.validate() {
            log_warn!(
                "Discarding insights for '{}': {}",
                run.entity.key,
                invalid
            );
            run.record(stage, StageOutcome::Discarded(invalid.to_string()));
            return Ok(());
        }

        run.entity.insights = Some(insights);
        run.entity.insights_generated_at = Some(self.clock.now());
        run.insights_written = true;
        self.persist(run).await?;
        run.record(stage, StageOutcome::Completed);
        Ok(())
    }

    /// Stage 8. An insight refresh alone never makes an entity cached.
    async fn commit(&self, mut run: Run<'_>) -> AppResult<EnrichmentReport> {
        let acceptable = run.stages.iter().all(|s| s.outcome.is_acceptable());
        let cached = match run.scope {
            RunScope::Full => acceptable,
            RunScope::Insights => {
                // An enrichment run may have finished in the meantime
                let latest = self.load(run.entity.id).await?;
                run.entity.cached = latest.cached;
                latest.cached && acceptable
            }
        };

        if run.entity.cached != cached {
            run.entity.cached = cached;
            run.cached_verdict = Some(cached);
            self.persist(&mut run).await?;
        }

        if cached {
            log_info!(
                "Entity '{}' fully enriched ({} external call(s))",
                run.entity.key,
                run.external_calls
            );
        } else {
            log_info!(
                "Entity '{}' partially enriched; incomplete stages will rerun",
                run.entity.key
            );
        }

        Ok(EnrichmentReport {
            entity_id: run.entity.id,
            key: run.entity.key.clone(),
            has_insights: run.entity.has_insights(),
            cached,
            external_calls: run.external_calls,
            stages: run.stages,
        })
    }
}

fn validate_interpretation(interpretation: Interpretation) -> AppResult<Interpretation> {
    let pronunciation = interpretation.pronunciation.trim().to_string();
    let gloss = interpretation.gloss.trim().to_string();
    if pronunciation.is_empty() || gloss.is_empty() {
        return Err(AppError::ValidationError(
            "interpretation returned an empty pronunciation or gloss".to_string(),
        ));
    }
    Ok(Interpretation {
        pronunciation,
        gloss,
    })
}

fn log_external<T>(service: ExternalService, key: &str, outcome: &AppResult<T>, started: Instant) {
    let status = match outcome {
        Ok(_) => "ok",
        Err(AppError::RateLimitExceeded(_)) => "rate_limited",
        Err(_) => "error",
    };
    LogContext::external_call(
        &service.to_string(),
        key,
        status,
        Some(started.elapsed().as_millis() as u64),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::enrichment::domain::{ConfusionEntry, Etymology, LearningTips, Mnemonics, RichInsights};
    use crate::modules::enrichment::infrastructure::{InMemoryEntityRepository, InMemoryMediaStore};
    use crate::modules::enrichment::ports::collaborators::{
        GeneratedMedia, MockAudioSynthesizer, MockConfusionAnalyzer, MockDictionaryLookup,
        MockImageGenerator, MockInsightGenerator, MockInterpreter,
    };
    use crate::modules::jobs::domain::lease::NoProgress;
    use crate::shared::config::ServiceRate;
    use crate::shared::utils::clock::ManualClock;

    struct Mocks {
        dictionary: MockDictionaryLookup,
        interpreter: MockInterpreter,
        confusion: MockConfusionAnalyzer,
        image: MockImageGenerator,
        audio: MockAudioSynthesizer,
        insights: MockInsightGenerator,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                dictionary: MockDictionaryLookup::new(),
                interpreter: MockInterpreter::new(),
                confusion: MockConfusionAnalyzer::new(),
                image: MockImageGenerator::new(),
                audio: MockAudioSynthesizer::new(),
                insights: MockInsightGenerator::new(),
            }
        }

        fn into_collaborators(self) -> Collaborators {
            Collaborators {
                dictionary: Arc::new(self.dictionary),
                interpreter: Arc::new(self.interpreter),
                confusion: Arc::new(self.confusion),
                image: Arc::new(self.image),
                audio: Arc::new(self.audio),
                insights: Arc::new(self.insights),
            }
        }
    }

    fn valid_insights() -> RichInsights {
        RichInsights {
            etymology: Etymology {
                origin: "Pictograph of a stream".to_string(),
                ..Default::default()
            },
            mnemonics: Mnemonics {
                visual: "Water splashing from a center line".to_string(),
                story: None,
            },
            learning_tips: LearningTips {
                for_beginners: vec!["Four strokes, start with the hook".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn media(content_type: &str) -> GeneratedMedia {
        GeneratedMedia {
            bytes: vec![1, 2, 3],
            content_type: content_type.to_string(),
        }
    }

    async fn setup(
        mocks: Mocks,
    ) -> (EnrichmentPipeline, Arc<InMemoryEntityRepository>, Uuid) {
        let clock = Arc::new(ManualClock::default());
        let repository = Arc::new(InMemoryEntityRepository::new());
        let entity = EnrichableEntity::new("水", clock.now());
        let id = entity.id;
        repository.save(&entity).await.unwrap();

        let limiters = ServiceRateLimiters::uniform(ServiceRate {
            rate_per_second: 1000.0,
            burst: Some(100),
        })
        .unwrap();

        let pipeline = EnrichmentPipeline::new(
            repository.clone(),
            mocks.into_collaborators(),
            Arc::new(InMemoryMediaStore::new()),
            limiters,
            clock,
        );
        (pipeline, repository, id)
    }

    fn happy_mocks() -> Mocks {
        let mut mocks = Mocks::new();
        mocks
            .dictionary
            .expect_lookup()
            .times(1)
            .returning(|_| Ok(vec![DictionaryEntry::new("水", "shui3", &["water"])]));
        mocks
            .confusion
            .expect_analyze()
            .times(1)
            .returning(|_, _| Ok(vec![ConfusionEntry::new("水", "self"), ConfusionEntry::new("永", "shape")]));
        mocks
            .image
            .expect_generate_image()
            .times(1)
            .returning(|_, _| Ok(media("image/png")));
        mocks
            .audio
            .expect_synthesize()
            .times(1)
            .returning(|_, _| Ok(media("audio/mpeg")));
        mocks
            .insights
            .expect_generate_insights()
            .times(1)
            .returning(|_, _| Ok(valid_insights()));
        mocks
    }

    #[tokio::test]
    async fn test_dictionary_hit_skips_interpretation() {
        let (pipeline, repository, id) = setup(happy_mocks()).await;
        let request = EnrichmentRequest {
            entity_id: id,
            ..Default::default()
        };

        let report = pipeline
            .enrich(&request, &LeaseGuard::detached(), &NoProgress)
            .await
            .unwrap();

        assert!(report.cached);
        assert_eq!(report.outcome(Stage::Interpretation), Some(&StageOutcome::Skipped));
        assert_eq!(report.external_calls, 5);

        let saved = repository.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(saved.pronunciation.as_deref(), Some("shui3"));
        assert_eq!(saved.gloss.as_deref(), Some("water"));
        let confusions: Vec<_> = saved.confusions.clone().unwrap().into_iter().map(|c| c.key).collect();
        assert_eq!(confusions, vec!["永"]);
        assert!(saved.has_insights());
    }

    #[tokio::test]
    async fn test_interpretation_failure_without_gloss_propagates() {
        let mut mocks = Mocks::new();
        mocks.dictionary.expect_lookup().returning(|_| Ok(vec![]));
        mocks
            .interpreter
            .expect_interpret()
            .times(1)
            .returning(|_, _| Err(AppError::ExternalServiceError("timeout".to_string())));
        let (pipeline, _, id) = setup(mocks).await;

        let request = EnrichmentRequest {
            entity_id: id,
            ..Default::default()
        };
        let err = pipeline
            .enrich(&request, &LeaseGuard::detached(), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ExternalServiceError(_)));
    }

    #[tokio::test]
    async fn test_empty_interpretation_is_rejected() {
        let mut mocks = Mocks::new();
        mocks.dictionary.expect_lookup().returning(|_| Ok(vec![]));
        mocks.interpreter.expect_interpret().returning(|_, _| {
            Ok(Interpretation {
                pronunciation: "shuǐ".to_string(),
                gloss: "  ".to_string(),
            })
        });
        let (pipeline, repository, id) = setup(mocks).await;

        let request = EnrichmentRequest {
            entity_id: id,
            ..Default::default()
        };
        let err = pipeline
            .enrich(&request, &LeaseGuard::detached(), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));

        let saved = repository.find_by_id(id).await.unwrap().unwrap();
        assert!(saved.gloss.is_none());
    }

    #[tokio::test]
    async fn test_image_failure_keeps_earlier_stages() {
        let mut mocks = happy_mocks();
        mocks.image = MockImageGenerator::new();
        mocks
            .image
            .expect_generate_image()
            .returning(|_, _| Err(AppError::ExternalServiceError("quota".to_string())));
        let (pipeline, repository, id) = setup(mocks).await;

        let request = EnrichmentRequest {
            entity_id: id,
            ..Default::default()
        };
        let report = pipeline
            .enrich(&request, &LeaseGuard::detached(), &NoProgress)
            .await
            .unwrap();

        assert!(!report.cached);
        assert!(matches!(report.outcome(Stage::Image), Some(StageOutcome::Failed(_))));
        assert_eq!(report.outcome(Stage::Audio), Some(&StageOutcome::Completed));

        let saved = repository.find_by_id(id).await.unwrap().unwrap();
        assert!(saved.complexity.is_some());
        assert!(saved.confusions.is_some());
        assert!(saved.image.is_none());
        assert!(saved.audio.is_some());
        assert!(!saved.cached);
    }

    #[tokio::test]
    async fn test_lost_lease_stops_writes() {
        let mut mocks = Mocks::new();
        mocks
            .dictionary
            .expect_lookup()
            .returning(|_| Ok(vec![DictionaryEntry::new("水", "shui3", &["water"])]));
        let (pipeline, repository, id) = setup(mocks).await;

        let lease = LeaseGuard::new(Uuid::new_v4(), Uuid::new_v4());
        lease.mark_lost();
        let request = EnrichmentRequest {
            entity_id: id,
            ..Default::default()
        };

        let err = pipeline.enrich(&request, &lease, &NoProgress).await.unwrap_err();
        assert!(matches!(err, AppError::LockLost(_)));

        let saved = repository.find_by_id(id).await.unwrap().unwrap();
        assert!(saved.pronunciation.is_none());
    }

    #[tokio::test]
    async fn test_missing_entity_is_not_found() {
        let (pipeline, _, _) = setup(Mocks::new()).await;
        let request = EnrichmentRequest {
            entity_id: Uuid::new_v4(),
            ..Default::default()
        };
        let err = pipeline
            .enrich(&request, &LeaseGuard::detached(), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_stage_positions() {
        assert_eq!(Stage::Lexical.position(), 1);
        assert_eq!(Stage::Insights.position(), 7);
        assert_eq!(Stage::Confusion.to_string(), "confusion");
    }
}
