//! Grouped dispatch of enrichment jobs.
//!
//! A batch shares one lock token and one renewal loop. Reference data is
//! looked up once per distinct key, then every job runs the ordinary
//! pipeline against the pre-fetched maps. A failing job never takes its
//! siblings down with it.

use super::pipeline::{EnrichmentPipeline, EnrichmentReport, EnrichmentRequest, Prefetch, Prefetched};
use super::reference_cache::{CacheStats, ReferenceCache};
use crate::modules::enrichment::domain::{DictionaryEntry, EnrichableEntity};
use crate::modules::enrichment::ports::{DictionaryLookup, EntityRepository, ExistingMedia, MediaStore};
use crate::modules::jobs::domain::entities::{EnrichEntityPayload, JobState, JobType, RefreshInsightsPayload};
use crate::modules::jobs::domain::lease::LeaseGuard;
use crate::modules::jobs::domain::repository::JobStore;
use crate::modules::jobs::worker::{JobContext, WorkerObserver};
use crate::shared::config::BatchSettings;
use crate::shared::errors::{AppError, AppResult};
use crate::shared::utils::clock::SharedClock;
use crate::shared::utils::logger::{LogContext, TimedOperation};
use crate::{log_debug, log_error, log_info, log_warn};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DICTIONARY_TTL: Duration = Duration::from_secs(3600);
const DICTIONARY_CAPACITY: usize = 5_000;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub base_size: usize,
    pub max_size: usize,
    pub inter_batch_delay: Duration,
    pub max_inter_batch_delay: Duration,
    /// Backlog depth that earns one more multiple of `base_size`
    pub backlog_step: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            base_size: 10,
            max_size: 50,
            inter_batch_delay: Duration::from_secs(2),
            max_inter_batch_delay: Duration::from_secs(20),
            backlog_step: 100,
        }
    }
}

impl BatchConfig {
    pub fn from_settings(settings: &BatchSettings) -> Self {
        Self {
            base_size: settings.size,
            max_size: settings.max_size,
            inter_batch_delay: settings.delay,
            max_inter_batch_delay: settings.delay * 10,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.base_size == 0 || self.max_size < self.base_size {
            return Err(AppError::ConfigurationError(format!(
                "batch size {} must be at least 1 and not exceed max {}",
                self.base_size, self.max_size
            )));
        }
        if self.backlog_step == 0 {
            return Err(AppError::ConfigurationError(
                "backlog step must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn growth_steps(&self, backlog: i64) -> usize {
        backlog.max(0) as usize / self.backlog_step.max(1)
    }

    pub fn size_for_backlog(&self, backlog: i64) -> usize {
        let steps = self.growth_steps(backlog);
        self.base_size
            .saturating_mul(steps.saturating_add(1))
            .min(self.max_size)
            .max(1)
    }

    /// Bigger backlogs get longer pauses so rate-limit buckets can refill
    pub fn delay_for_backlog(&self, backlog: i64) -> Duration {
        let steps = self.growth_steps(backlog).min(u32::MAX as usize) as u32;
        self.inter_batch_delay
            .saturating_mul(steps.saturating_add(1))
            .min(self.max_inter_batch_delay.max(self.inter_batch_delay))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub dequeued: usize,
    pub completed: usize,
    pub failed: usize,
    /// Finished after losing the lock; outcome discarded
    pub lost: usize,
    pub backlog: i64,
}

enum Planned {
    Enrich(EnrichmentRequest),
    Refresh(EnrichmentRequest),
}

impl Planned {
    fn from_job(ctx: &JobContext) -> AppResult<Self> {
        let job = ctx.job();
        match job.job_type {
            JobType::EnrichEntity => Ok(Planned::Enrich(
                job.parse_payload::<EnrichEntityPayload>()?.into(),
            )),
            JobType::RefreshInsights => Ok(Planned::Refresh(
                job.parse_payload::<RefreshInsightsPayload>()?.into(),
            )),
        }
    }

    fn request(&self) -> &EnrichmentRequest {
        match self {
            Planned::Enrich(request) | Planned::Refresh(request) => request,
        }
    }
}

pub struct BatchProcessor {
    name: String,
    pipeline: Arc<EnrichmentPipeline>,
    repository: Arc<dyn EntityRepository>,
    dictionary: Arc<dyn DictionaryLookup>,
    media: Arc<dyn MediaStore>,
    cache: ReferenceCache<Vec<DictionaryEntry>>,
    config: BatchConfig,
    observers: Vec<Arc<dyn WorkerObserver>>,
}

impl BatchProcessor {
    pub fn new(
        name: &str,
        pipeline: Arc<EnrichmentPipeline>,
        repository: Arc<dyn EntityRepository>,
        dictionary: Arc<dyn DictionaryLookup>,
        media: Arc<dyn MediaStore>,
        clock: SharedClock,
        config: BatchConfig,
    ) -> AppResult<Self> {
        config.validate()?;
        Ok(Self {
            name: name.to_string(),
            pipeline,
            repository,
            dictionary,
            media,
            cache: ReferenceCache::new(clock, DICTIONARY_TTL, DICTIONARY_CAPACITY),
            config,
            observers: Vec::new(),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn WorkerObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Run every job in `contexts`; results come back in the same order
    pub async fn process_batch(&self, contexts: &[JobContext]) -> Vec<AppResult<EnrichmentReport>> {
        let timer = TimedOperation::new(&format!("batch of {}", contexts.len()));
        let plans: Vec<AppResult<Planned>> = contexts.iter().map(Planned::from_job).collect();

        let ids: Vec<Uuid> = plans
            .iter()
            .filter_map(|plan| plan.as_ref().ok())
            .map(|plan| plan.request().entity_id)
            .collect();

        let entities = match self.repository.find_many(&ids).await {
            Ok(entities) => entities,
            Err(e) => {
                log_error!("Batch entity pre-fetch failed: {}", e);
                return contexts.iter().map(|_| Err(e.clone())).collect();
            }
        };

        let mut lexical_keys = Vec::new();
        let mut media_keys = Vec::new();
        for plan in plans.iter().filter_map(|plan| plan.as_ref().ok()) {
            let Planned::Enrich(request) = plan else { continue };
            let Some(entity) = entities.get(&request.entity_id) else { continue };

            if needs_lexical(entity, request.force) && !lexical_keys.contains(&entity.key) {
                lexical_keys.push(entity.key.clone());
            }
            if needs_media(entity, request.force) && !media_keys.contains(&entity.key) {
                media_keys.push(entity.key.clone());
            }
        }

        let dictionary = self.prefetch_dictionary(&lexical_keys).await;
        let media = self.prefetch_media(&media_keys).await;
        log_debug!(
            "Batch pre-fetched {} entities, {} dictionary keys, {} media keys",
            entities.len(),
            lexical_keys.len(),
            media_keys.len()
        );

        let finished = AtomicUsize::new(0);
        let total = contexts.len();
        let runs = contexts.iter().zip(plans).map(|(ctx, plan)| {
            let entities = &entities;
            let dictionary = &dictionary;
            let media = &media;
            let finished = &finished;
            async move {
                let result = match plan {
                    Err(e) => Err(e),
                    Ok(Planned::Refresh(request)) => {
                        self.pipeline.refresh_insights(&request, ctx.lease(), ctx).await
                    }
                    Ok(Planned::Enrich(request)) => match entities.get(&request.entity_id) {
                        None => Err(AppError::NotFound(format!(
                            "entity {} not found",
                            request.entity_id
                        ))),
                        Some(entity) => {
                            let prefetched = Prefetched {
                                dictionary: dictionary.get(&entity.key).cloned().unwrap_or_default(),
                                media: media.get(&entity.key).cloned().unwrap_or_default(),
                            };
                            self.pipeline
                                .enrich_entity(entity.clone(), &request, prefetched, ctx.lease(), ctx)
                                .await
                        }
                    },
                };

                let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                LogContext::batch_progress(done, total, &ctx.job().id.to_string());
                result
            }
        });

        let results = join_all(runs).await;
        timer.finish();
        results
    }

    async fn prefetch_dictionary(
        &self,
        keys: &[String],
    ) -> HashMap<String, Prefetch<Vec<DictionaryEntry>>> {
        let lookups = keys.iter().map(|key| async move {
            if let Some(cached) = self.cache.get(key) {
                return (key.clone(), Prefetch::Fetched(cached));
            }
            match self.dictionary.lookup(key).await {
                Ok(entries) => {
                    self.cache.insert(key, entries.clone());
                    (key.clone(), Prefetch::Fetched(entries))
                }
                Err(e) => {
                    log_warn!("Dictionary pre-fetch failed for '{}': {}", key, e);
                    (key.clone(), Prefetch::Failed(e.to_string()))
                }
            }
        });
        join_all(lookups).await.into_iter().collect()
    }

    async fn prefetch_media(&self, keys: &[String]) -> HashMap<String, Prefetch<ExistingMedia>> {
        let checks = keys.iter().map(|key| async move {
            match self.media.find_existing(key).await {
                Ok(existing) => (key.clone(), Prefetch::Fetched(existing)),
                Err(e) => {
                    log_warn!("Media pre-fetch failed for '{}': {}", key, e);
                    (key.clone(), Prefetch::Failed(e.to_string()))
                }
            }
        });
        join_all(checks).await.into_iter().collect()
    }

    /// Dequeue one batch sized for the current backlog, process it and
    /// settle every job individually.
    pub async fn run_batch(
        &self,
        store: &Arc<dyn JobStore>,
        queue: &str,
        lock_duration: Duration,
    ) -> AppResult<BatchSummary> {
        let backlog = store.statistics(queue).await?.backlog();
        let size = self.config.size_for_backlog(backlog);
        let token = Uuid::new_v4();

        let jobs = store.dequeue_batch(queue, size, token, lock_duration).await?;
        let mut summary = BatchSummary {
            dequeued: jobs.len(),
            backlog,
            ..Default::default()
        };
        if jobs.is_empty() {
            self.notify(|o| o.on_idle(&self.name));
            return Ok(summary);
        }

        log_debug!(
            "Batch processor {} took {} job(s) from '{}' (backlog {})",
            self.name,
            jobs.len(),
            queue,
            backlog
        );

        let leases: Vec<LeaseGuard> = jobs.iter().map(|job| LeaseGuard::new(job.id, token)).collect();
        let contexts: Vec<JobContext> = jobs
            .into_iter()
            .zip(leases.iter().cloned())
            .map(|(job, lease)| JobContext::new(job, lease, store.clone()))
            .collect();
        for ctx in &contexts {
            self.notify(|o| o.on_active(&self.name, ctx.job()));
        }

        let stop_renewing = CancellationToken::new();
        let renewals = spawn_renewals(
            store.clone(),
            leases,
            lock_duration,
            stop_renewing.clone(),
        );

        let results = self.process_batch(&contexts).await;

        stop_renewing.cancel();
        if let Err(e) = renewals.await {
            log_warn!("Batch lock renewal task ended abnormally: {}", e);
        }

        for (ctx, result) in contexts.iter().zip(results) {
            self.settle(store, ctx, result, &mut summary).await;
        }

        Ok(summary)
    }

    async fn settle(
        &self,
        store: &Arc<dyn JobStore>,
        ctx: &JobContext,
        result: AppResult<EnrichmentReport>,
        summary: &mut BatchSummary,
    ) {
        let job = ctx.job();
        let token = ctx.lease().token();

        if !ctx.lease().is_held() {
            summary.lost += 1;
            let error = AppError::LockLost(format!(
                "job {} finished after losing its lock; result discarded",
                job.id
            ));
            log_warn!("Batch processor {}: {}", self.name, error);
            self.notify(|o| o.on_error(&self.name, &error));
            return;
        }

        let outcome = result.and_then(|report| Ok(serde_json::to_value(&report)?));
        match outcome {
            Ok(value) => match store.complete(job.id, token, value.clone()).await {
                Ok(completed) => {
                    summary.completed += 1;
                    self.notify(|o| o.on_completed(&self.name, &completed, &value));
                }
                Err(e) => {
                    log_error!("Could not complete job {}: {}", job.id, e);
                    self.notify(|o| o.on_error(&self.name, &e));
                }
            },
            Err(error) => {
                match store
                    .fail(job.id, token, &error.to_string(), error.is_retryable())
                    .await
                {
                    Ok(failed) => {
                        summary.failed += 1;
                        let terminal = failed.state == JobState::Failed;
                        log_warn!(
                            "Batch job {} failed (attempt {}/{}): {}",
                            job.id,
                            failed.attempts_made,
                            failed.max_attempts,
                            error
                        );
                        self.notify(|o| o.on_failed(&self.name, &failed, &error, terminal));
                    }
                    Err(e) => {
                        log_error!("Could not fail job {}: {}", job.id, e);
                        self.notify(|o| o.on_error(&self.name, &e));
                    }
                }
            }
        }
    }

    /// Repeat `run_batch` until `shutdown` fires
    pub async fn run_loop(
        &self,
        store: Arc<dyn JobStore>,
        queue: &str,
        lock_duration: Duration,
        shutdown: CancellationToken,
    ) {
        log_info!(
            "Batch processor {} started on queue '{}' (batch size {}-{})",
            self.name,
            queue,
            self.config.base_size,
            self.config.max_size
        );

        while !shutdown.is_cancelled() {
            self.cache.evict_expired();

            let pause = match self.run_batch(&store, queue, lock_duration).await {
                Ok(summary) if summary.dequeued == 0 => self.config.inter_batch_delay,
                Ok(summary) => {
                    log_info!(
                        "Batch processor {}: {} completed, {} failed, {} lost (backlog {})",
                        self.name,
                        summary.completed,
                        summary.failed,
                        summary.lost,
                        summary.backlog
                    );
                    self.config.delay_for_backlog(summary.backlog)
                }
                Err(e) => {
                    log_error!("Batch processor {} failed to run a batch: {}", self.name, e);
                    self.notify(|o| o.on_error(&self.name, &e));
                    self.config.inter_batch_delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        log_info!("Batch processor {} stopped", self.name);
    }

    pub fn spawn(
        self: Arc<Self>,
        store: Arc<dyn JobStore>,
        queue: &str,
        lock_duration: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = queue.to_string();
        tokio::spawn(async move {
            self.run_loop(store, &queue, lock_duration, shutdown).await
        })
    }

    fn notify<F: Fn(&dyn WorkerObserver)>(&self, event: F) {
        for observer in &self.observers {
            event(observer.as_ref());
        }
    }
}

fn needs_lexical(entity: &EnrichableEntity, force: bool) -> bool {
    force || !(entity.has_pronunciation() && entity.has_gloss())
}

fn needs_media(entity: &EnrichableEntity, force: bool) -> bool {
    force || entity.image.is_none() || entity.audio.is_none()
}

/// Renew every still-held lease of a batch on one interval
fn spawn_renewals(
    store: Arc<dyn JobStore>,
    leases: Vec<LeaseGuard>,
    lock_duration: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    let every = (lock_duration / 2).max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    for lease in leases.iter().filter(|lease| lease.is_held()) {
                        match store.renew_lock(lease.job_id(), lease.token(), lock_duration).await {
                            Ok(()) => {}
                            Err(AppError::LockLost(reason)) => {
                                log_warn!("Batch job {} lost its lock: {}", lease.job_id(), reason);
                                lease.mark_lost();
                            }
                            Err(e) => log_warn!("Could not renew lock on job {}: {}", lease.job_id(), e),
                        }
                    }
                }
                _ = stop.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_grows_with_backlog_up_to_max() {
        let config = BatchConfig::default();
        assert_eq!(config.size_for_backlog(0), 10);
        assert_eq!(config.size_for_backlog(99), 10);
        assert_eq!(config.size_for_backlog(100), 20);
        assert_eq!(config.size_for_backlog(250), 30);
        assert_eq!(config.size_for_backlog(10_000), 50);
        assert_eq!(config.size_for_backlog(-5), 10);
    }

    #[test]
    fn test_delay_grows_with_backlog_up_to_max() {
        let config = BatchConfig::default();
        assert_eq!(config.delay_for_backlog(0), Duration::from_secs(2));
        assert_eq!(config.delay_for_backlog(200), Duration::from_secs(6));
        assert_eq!(config.delay_for_backlog(1_000_000), Duration::from_secs(20));
    }

    #[test]
    fn test_validate_rejects_inverted_sizes() {
        let config = BatchConfig {
            base_size: 20,
            max_size: 10,
            ..BatchConfig::default()
        };
        assert!(matches!(config.validate(), Err(AppError::ConfigurationError(_))));
        assert!(BatchConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_settings() {
        let config = BatchConfig::from_settings(&BatchSettings {
            size: 5,
            max_size: 25,
            delay: Duration::from_millis(500),
        });
        assert_eq!(config.base_size, 5);
        assert_eq!(config.max_inter_batch_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_needs_prefetch() {
        let mut entity = EnrichableEntity::new("水", chrono::Utc::now());
        assert!(needs_lexical(&entity, false));
        assert!(needs_media(&entity, false));

        entity.pronunciation = Some("shuǐ".to_string());
        entity.gloss = Some("water".to_string());
        assert!(!needs_lexical(&entity, false));
        assert!(needs_lexical(&entity, true));
    }
}
