/// Pipeline harness wired to fakes and in-memory stores
use super::fakes::{CountingMediaStore, FakeCollaborators};
use hanzi_enrichment::modules::enrichment::domain::EnrichableEntity;
use hanzi_enrichment::modules::enrichment::infrastructure::InMemoryEntityRepository;
use hanzi_enrichment::modules::enrichment::{
    BatchConfig, BatchProcessor, Collaborators, EnrichmentPipeline, EnrichmentService,
    EntityRepository,
};
use hanzi_enrichment::modules::jobs::{InMemoryJobStore, JobState, JobStatusSnapshot, JobStore};
use hanzi_enrichment::modules::rate_limit::ServiceRateLimiters;
use hanzi_enrichment::shared::config::ServiceRate;
use hanzi_enrichment::shared::utils::{SharedClock, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct TestHarness {
    pub collaborators: Arc<FakeCollaborators>,
    pub media: Arc<CountingMediaStore>,
    pub repository: InMemoryEntityRepository,
    pub jobs: InMemoryJobStore,
    pub clock: SharedClock,
    pub pipeline: Arc<EnrichmentPipeline>,
}

/// Limits high enough that tests never wait on them
pub fn generous_limiters() -> ServiceRateLimiters {
    ServiceRateLimiters::uniform(ServiceRate {
        rate_per_second: 1000.0,
        burst: Some(100),
    })
    .expect("valid limiter settings")
}

pub fn build_harness(collaborators: FakeCollaborators) -> TestHarness {
    let clock: SharedClock = Arc::new(SystemClock);
    let collaborators = Arc::new(collaborators);
    let media = Arc::new(CountingMediaStore::new());
    let repository = InMemoryEntityRepository::new();

    let pipeline = Arc::new(EnrichmentPipeline::new(
        Arc::new(repository.clone()),
        Collaborators::from_gateway(collaborators.clone()),
        media.clone(),
        generous_limiters(),
        clock.clone(),
    ));

    TestHarness {
        collaborators,
        media,
        repository,
        jobs: InMemoryJobStore::with_clock(clock.clone()),
        clock,
        pipeline,
    }
}

impl TestHarness {
    pub async fn save(&self, entity: &EnrichableEntity) {
        self.repository.save(entity).await.expect("save entity");
    }

    pub async fn load(&self, entity_id: Uuid) -> EnrichableEntity {
        self.repository
            .find_by_id(entity_id)
            .await
            .expect("load entity")
            .expect("entity exists")
    }

    pub fn service(&self) -> EnrichmentService {
        EnrichmentService::new(
            Arc::new(self.jobs.clone()),
            Arc::new(self.repository.clone()),
            self.clock.clone(),
        )
    }

    pub fn batch_processor(&self, config: BatchConfig) -> BatchProcessor {
        BatchProcessor::new(
            "test-batch",
            self.pipeline.clone(),
            Arc::new(self.repository.clone()),
            self.collaborators.clone(),
            self.media.clone(),
            self.clock.clone(),
            config,
        )
        .expect("valid batch config")
    }
}

/// Poll a job until it reaches a terminal state
pub async fn wait_for_terminal(
    store: &dyn JobStore,
    job_id: Uuid,
    timeout: Duration,
) -> JobStatusSnapshot {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = store.get_status(job_id).await.expect("job status");
        if matches!(status.state, JobState::Completed | JobState::Failed) {
            return status;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("job {} still {:?} after {:?}", job_id, status.state, timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
