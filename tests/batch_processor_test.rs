/// Batch processor tests
///
/// Tests cover:
/// - One reference lookup per distinct key across a batch
/// - Failure isolation between jobs in the same batch
/// - Missing entities and empty queues
mod utils;

use hanzi_enrichment::modules::enrichment::domain::EnrichableEntity;
use hanzi_enrichment::modules::enrichment::BatchConfig;
use hanzi_enrichment::modules::jobs::{
    queues, EnqueueOptions, EnrichEntityPayload, JobRecord, JobState, JobStore, NewJob,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use utils::{factories, fakes::FakeCollaborators, helpers};
use uuid::Uuid;

const LOCK: Duration = Duration::from_secs(30);

async fn enqueue(store: &dyn JobStore, entity_id: Uuid) -> JobRecord {
    let payload = EnrichEntityPayload {
        entity_id,
        user_id: None,
        force: false,
        provider: None,
    };
    let job = NewJob::enrich_entity(queues::ENRICHMENT, &payload, EnqueueOptions::default())
        .expect("build job");
    store.enqueue(job).await.expect("enqueue job")
}

#[tokio::test]
async fn batch_fetches_reference_data_once_per_key_and_isolates_failures() {
    let harness = helpers::build_harness(FakeCollaborators::new());
    let keys = ["水", "火", "山"];

    let entities: Vec<EnrichableEntity> = (0..10)
        .map(|i| factories::entity(keys[i % keys.len()]))
        .collect();
    for entity in &entities {
        harness.save(entity).await;
    }
    let failing = entities[4].id;
    harness.collaborators.fail_interpretation_for(failing);

    let mut jobs = Vec::new();
    for entity in &entities {
        jobs.push(enqueue(&harness.jobs, entity.id).await);
    }

    let store: Arc<dyn JobStore> = Arc::new(harness.jobs.clone());
    let processor = harness.batch_processor(BatchConfig::default());
    let summary = processor
        .run_batch(&store, queues::ENRICHMENT, LOCK)
        .await
        .unwrap();

    assert_eq!(summary.dequeued, 10);
    assert_eq!(summary.completed, 9);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.lost, 0);

    assert_eq!(harness.collaborators.dictionary_calls(), 3);
    // One pre-fetch per key, then one re-check under the lock per generated asset
    assert_eq!(harness.media.checks(), 3 + 3 * 2);
    assert_eq!(harness.collaborators.calls.image.load(Ordering::SeqCst), 3);

    for (entity, job) in entities.iter().zip(&jobs) {
        let status = harness.jobs.get_status(job.id).await.unwrap();
        if entity.id == failing {
            // Retryable, so it goes back to waiting with one attempt used
            assert_eq!(status.state, JobState::Waiting);
            assert_eq!(status.attempts_made, 1);
            assert!(status.failed_reason.is_some());
            assert!(harness.load(entity.id).await.gloss.is_none());
        } else {
            assert_eq!(status.state, JobState::Completed, "job for {}", entity.key);
            let stored = harness.load(entity.id).await;
            assert!(stored.cached);
            assert!(stored.image.is_some());
        }
    }
}

#[tokio::test]
async fn missing_entity_fails_only_its_own_job() {
    let harness = helpers::build_harness(FakeCollaborators::new());
    let present = factories::entity("木");
    harness.save(&present).await;

    let ok = enqueue(&harness.jobs, present.id).await;
    let missing = enqueue(&harness.jobs, Uuid::new_v4()).await;

    let store: Arc<dyn JobStore> = Arc::new(harness.jobs.clone());
    let summary = harness
        .batch_processor(BatchConfig::default())
        .run_batch(&store, queues::ENRICHMENT, LOCK)
        .await
        .unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);

    let ok = harness.jobs.get_status(ok.id).await.unwrap();
    assert_eq!(ok.state, JobState::Completed);

    // The entity may still be written later, so the job is retried
    let missing = harness.jobs.get_status(missing.id).await.unwrap();
    assert_eq!(missing.state, JobState::Waiting);
    assert_eq!(missing.attempts_made, 1);
    assert!(missing.failed_reason.unwrap().contains("not found"));
}

#[tokio::test]
async fn empty_queue_yields_empty_summary() {
    let harness = helpers::build_harness(FakeCollaborators::new());
    let store: Arc<dyn JobStore> = Arc::new(harness.jobs.clone());

    let summary = harness
        .batch_processor(BatchConfig::default())
        .run_batch(&store, queues::ENRICHMENT, LOCK)
        .await
        .unwrap();

    assert_eq!(summary.dequeued, 0);
    assert_eq!(summary.completed + summary.failed + summary.lost, 0);
    assert_eq!(harness.collaborators.total_calls(), 0);
}

#[tokio::test]
async fn batch_size_respects_configured_base() {
    let harness = helpers::build_harness(FakeCollaborators::new());
    for _ in 0..5 {
        let entity = factories::entity("月");
        harness.save(&entity).await;
        enqueue(&harness.jobs, entity.id).await;
    }

    let store: Arc<dyn JobStore> = Arc::new(harness.jobs.clone());
    let processor = harness.batch_processor(BatchConfig {
        base_size: 2,
        max_size: 4,
        ..BatchConfig::default()
    });

    let first = processor
        .run_batch(&store, queues::ENRICHMENT, LOCK)
        .await
        .unwrap();
    assert_eq!(first.dequeued, 2);
    assert_eq!(first.backlog, 5);

    let stats = harness.jobs.statistics(queues::ENRICHMENT).await.unwrap();
    assert_eq!(stats.backlog(), 3);
}
