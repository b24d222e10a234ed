//! Submission facade used by importers and the UI.

use crate::modules::enrichment::domain::EnrichableEntity;
use crate::modules::enrichment::ports::EntityRepository;
use crate::modules::jobs::domain::entities::{
    EnqueueOptions, EnrichEntityPayload, JobRecord, JobStatusSnapshot, NewJob,
    RefreshInsightsPayload,
};
use crate::modules::jobs::domain::repository::{JobStatistics, JobStore};
use crate::modules::jobs::queues;
use crate::shared::errors::{AppError, AppResult};
use crate::shared::utils::clock::{Clock, SharedClock};
use crate::{log_debug, log_info, log_warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentRequestOptions {
    pub user_id: Option<String>,
    /// Redo stages even when their output exists
    pub force: bool,
    pub provider: Option<String>,
    pub priority: i32,
    pub delay: Duration,
    pub max_attempts: Option<u32>,
}

pub struct EnrichmentService {
    store: Arc<dyn JobStore>,
    repository: Arc<dyn EntityRepository>,
    clock: SharedClock,
    enrichment_queue: String,
    insights_queue: String,
    defaults: EnqueueOptions,
}

impl EnrichmentService {
    pub fn new(
        store: Arc<dyn JobStore>,
        repository: Arc<dyn EntityRepository>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            repository,
            clock,
            enrichment_queue: queues::ENRICHMENT.to_string(),
            insights_queue: queues::INSIGHTS.to_string(),
            defaults: EnqueueOptions::default(),
        }
    }

    pub fn with_queues(mut self, enrichment: &str, insights: &str) -> Self {
        self.enrichment_queue = enrichment.to_string();
        self.insights_queue = insights.to_string();
        self
    }

    /// Backoff and attempt limits applied when a request does not override them
    pub fn with_defaults(mut self, defaults: EnqueueOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn enrichment_queue(&self) -> &str {
        &self.enrichment_queue
    }

    /// Find the entity for `key`, creating an empty one on first reference
    pub async fn register_entity(&self, key: &str) -> AppResult<EnrichableEntity> {
        let key = key.trim();
        if key.is_empty() {
            return Err(AppError::InvalidInput("entity key must not be empty".to_string()));
        }

        if let Some(existing) = self.repository.find_by_key(key).await? {
            return Ok(existing);
        }

        let entity = EnrichableEntity::new(key, self.clock.now());
        self.repository.save(&entity).await?;
        log_debug!("Registered entity {} for '{}'", entity.id, key);
        Ok(entity)
    }

    /// Queue a full enrichment run. While a job for this entity is still
    /// waiting or active, that job is returned instead of a new one. A forced
    /// request upgrades a waiting job in place and is replayed after an
    /// active one, so the re-run always happens.
    pub async fn request_enrichment(
        &self,
        entity_id: Uuid,
        options: EnrichmentRequestOptions,
    ) -> AppResult<JobRecord> {
        self.ensure_exists(entity_id).await?;

        let payload = EnrichEntityPayload {
            entity_id,
            user_id: options.user_id.clone(),
            force: options.force,
            provider: options.provider.clone(),
        };
        let job = NewJob::enrich_entity(
            &self.enrichment_queue,
            &payload,
            self.enqueue_options(&options, format!("entity:{}", entity_id)),
        )?;

        let record = self.store.enqueue(job).await?;
        self.log_submission(&record, entity_id, &serde_json::to_value(&payload)?);
        Ok(record)
    }

    /// Queue enrichment for many entities, e.g. after an import. Unknown ids
    /// are skipped with a warning.
    pub async fn request_bulk_enrichment(
        &self,
        entity_ids: &[Uuid],
        options: EnrichmentRequestOptions,
    ) -> AppResult<Vec<JobRecord>> {
        let mut records = Vec::with_capacity(entity_ids.len());
        for entity_id in entity_ids {
            match self.request_enrichment(*entity_id, options.clone()).await {
                Ok(record) => records.push(record),
                Err(AppError::NotFound(reason)) => {
                    log_warn!("Skipping bulk enrichment for {}: {}", entity_id, reason)
                }
                Err(e) => return Err(e),
            }
        }
        log_info!(
            "Queued {} of {} entities for enrichment",
            records.len(),
            entity_ids.len()
        );
        Ok(records)
    }

    /// Queue regeneration of rich insights only
    pub async fn request_insight_refresh(
        &self,
        entity_id: Uuid,
        user_id: Option<String>,
    ) -> AppResult<JobRecord> {
        self.ensure_exists(entity_id).await?;

        let payload = RefreshInsightsPayload { entity_id, user_id };
        let options = EnrichmentRequestOptions::default();
        let job = NewJob::refresh_insights(
            &self.insights_queue,
            &payload,
            self.enqueue_options(&options, format!("insights:{}", entity_id)),
        )?;

        let record = self.store.enqueue(job).await?;
        self.log_submission(&record, entity_id, &serde_json::to_value(&payload)?);
        Ok(record)
    }

    pub async fn status(&self, job_id: Uuid) -> AppResult<JobStatusSnapshot> {
        self.store.get_status(job_id).await
    }

    pub async fn queue_statistics(&self) -> AppResult<BTreeMap<String, JobStatistics>> {
        let mut statistics = BTreeMap::new();
        for queue in [&self.enrichment_queue, &self.insights_queue] {
            statistics.insert(queue.clone(), self.store.statistics(queue).await?);
        }
        Ok(statistics)
    }

    /// Delete finished jobs older than `retention_days`, by the store's clock
    pub async fn cleanup_finished(&self, retention_days: u32) -> AppResult<usize> {
        let max_age = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
        let removed = self.store.delete_finished_older_than(max_age).await?;
        if removed > 0 {
            log_info!("Removed {} finished job(s) older than {} days", removed, retention_days);
        }
        Ok(removed)
    }

    async fn ensure_exists(&self, entity_id: Uuid) -> AppResult<()> {
        match self.repository.find_by_id(entity_id).await? {
            Some(_) => Ok(()),
            None => Err(AppError::NotFound(format!("entity {} not found", entity_id))),
        }
    }

    fn enqueue_options(&self, options: &EnrichmentRequestOptions, dedupe_key: String) -> EnqueueOptions {
        EnqueueOptions {
            priority: options.priority,
            delay: options.delay,
            max_attempts: options.max_attempts.unwrap_or(self.defaults.max_attempts),
            backoff: self.defaults.backoff.clone(),
            dedupe_key: Some(dedupe_key),
            supersede: options.force,
        }
    }

    fn log_submission(&self, record: &JobRecord, entity_id: Uuid, payload: &serde_json::Value) {
        if record.follow_up.as_ref() == Some(payload) {
            log_info!(
                "Entity {} is being enriched by job {}; re-run queued after it",
                entity_id,
                record.id
            );
        } else if &record.payload == payload {
            log_info!(
                "Queued job {} on '{}' for entity {}",
                record.id,
                record.queue,
                entity_id
            );
        } else {
            log_debug!(
                "Entity {} already has outstanding job {}; reusing it",
                entity_id,
                record.id
            );
        }
    }
}
