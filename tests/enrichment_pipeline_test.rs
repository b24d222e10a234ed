/// Enrichment pipeline tests
///
/// Tests cover:
/// - End-to-end enrichment through the service, queue and worker
/// - Idempotence of a second run
/// - Confusion filtering and insight validation
/// - Shared media across entities with the same key
/// - Insight refreshes overlapping a full enrichment run
mod utils;

use hanzi_enrichment::modules::enrichment::domain::MediaKind;
use hanzi_enrichment::modules::enrichment::ports::ExistingMedia;
use hanzi_enrichment::modules::enrichment::application::{Prefetch, Prefetched};
use hanzi_enrichment::modules::enrichment::{
    Collaborators, EnrichmentJobHandler, EnrichmentPipeline, EnrichmentRequest,
    EnrichmentRequestOptions, Stage, StageOutcome,
};
use hanzi_enrichment::modules::jobs::{
    queues, JobState, LeaseGuard, NoProgress, Worker, WorkerConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use utils::{factories, fakes::FakeCollaborators, helpers};

fn request(entity_id: uuid::Uuid) -> EnrichmentRequest {
    EnrichmentRequest {
        entity_id,
        ..Default::default()
    }
}

// ================================================================================================
// END TO END
// ================================================================================================

#[tokio::test]
async fn enqueued_entity_is_fully_enriched_by_worker() {
    let fakes = FakeCollaborators::new()
        .with_dictionary(
            "水",
            vec![factories::dictionary_entry("水", "shui3", &["water", "river"])],
        )
        .with_confusions(
            "水",
            factories::confusions(&[("水", "itself"), ("永", "similar shape"), ("冰", "ice")]),
        );
    let harness = helpers::build_harness(fakes);
    let service = harness.service();

    let entity = service.register_entity("水").await.unwrap();
    let job = service
        .request_enrichment(entity.id, EnrichmentRequestOptions::default())
        .await
        .unwrap();

    let config = WorkerConfig::new("e2e", queues::ENRICHMENT)
        .with_lock_duration(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(10));
    let handler = Arc::new(EnrichmentJobHandler::new(harness.pipeline.clone()));
    let worker = Worker::new(config, Arc::new(harness.jobs.clone()), handler)
        .unwrap()
        .spawn();

    let status = helpers::wait_for_terminal(&harness.jobs, job.id, Duration::from_secs(5)).await;
    worker.shutdown().await.unwrap();
    assert_eq!(status.state, JobState::Completed);

    let enriched = harness.load(entity.id).await;
    assert_eq!(enriched.pronunciation.as_deref(), Some("shui3"));
    assert_eq!(enriched.gloss.as_deref(), Some("water; river"));

    let difficulty = enriched.complexity.as_ref().unwrap().difficulty;
    assert!((0.0..=1.0).contains(&difficulty));

    let confusions = enriched.confusions.as_ref().unwrap();
    assert!(!confusions.is_empty());
    assert!(confusions.iter().all(|entry| entry.key != "水"));

    assert!(enriched.image.is_some());
    assert!(enriched.audio.is_some());
    assert!(enriched.has_insights());
    assert!(enriched.cached);

    let result = status.result.unwrap();
    assert_eq!(result["cached"], true);
}

#[tokio::test]
async fn entity_is_not_cached_when_a_stage_is_discarded() {
    let fakes = FakeCollaborators::new()
        .with_insights("水", factories::insights_without_origin("水"));
    let harness = helpers::build_harness(fakes);

    let entity = factories::entity("水");
    harness.save(&entity).await;

    let report = harness
        .pipeline
        .enrich(&request(entity.id), &LeaseGuard::detached(), &NoProgress)
        .await
        .unwrap();

    assert!(!report.cached);
    assert!(matches!(
        report.outcome(Stage::Insights),
        Some(StageOutcome::Discarded(_))
    ));
    assert!(!harness.load(entity.id).await.cached);
}

// ================================================================================================
// IDEMPOTENCE
// ================================================================================================

#[tokio::test]
async fn second_run_makes_no_external_calls() {
    let harness = helpers::build_harness(
        FakeCollaborators::new()
            .with_dictionary("火", vec![factories::dictionary_entry("火", "huo3", &["fire"])]),
    );
    let entity = factories::entity("火");
    harness.save(&entity).await;

    let first = harness
        .pipeline
        .enrich(&request(entity.id), &LeaseGuard::detached(), &NoProgress)
        .await
        .unwrap();
    assert!(first.cached);
    assert!(first.external_calls > 0);

    let calls_after_first = harness.collaborators.total_calls();
    let writes_after_first = harness.media.writes.load(Ordering::SeqCst);

    let second = harness
        .pipeline
        .enrich(&request(entity.id), &LeaseGuard::detached(), &NoProgress)
        .await
        .unwrap();

    assert_eq!(second.external_calls, 0);
    assert_eq!(harness.collaborators.total_calls(), calls_after_first);
    assert_eq!(harness.media.writes.load(Ordering::SeqCst), writes_after_first);
    assert!(second
        .stages
        .iter()
        .all(|stage| stage.outcome == StageOutcome::Skipped));
    assert!(second.cached);
}

#[tokio::test]
async fn forced_run_regenerates_text_but_relinks_media() {
    let harness = helpers::build_harness(FakeCollaborators::new());
    let entity = factories::entity("山");
    harness.save(&entity).await;

    harness
        .pipeline
        .enrich(&request(entity.id), &LeaseGuard::detached(), &NoProgress)
        .await
        .unwrap();
    let image_calls = harness.collaborators.calls.image.load(Ordering::SeqCst);

    let forced = EnrichmentRequest {
        entity_id: entity.id,
        force: true,
        ..Default::default()
    };
    let report = harness
        .pipeline
        .enrich(&forced, &LeaseGuard::detached(), &NoProgress)
        .await
        .unwrap();

    assert_eq!(report.outcome(Stage::Insights), Some(&StageOutcome::Completed));
    assert_eq!(harness.collaborators.calls.insights.load(Ordering::SeqCst), 2);
    assert_eq!(
        harness.collaborators.calls.image.load(Ordering::SeqCst),
        image_calls
    );
}

/// Wait until a gated collaborator call has started
async fn wait_for_call(counter: &AtomicUsize, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while counter.load(Ordering::SeqCst) < expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "collaborator never called"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ================================================================================================
// CONFUSIONS AND INSIGHTS
// ================================================================================================

#[tokio::test]
async fn confusions_never_include_the_word_or_its_characters() {
    let fakes = FakeCollaborators::new().with_confusions(
        "房間",
        factories::confusions(&[
            ("房間", "same word"),
            ("房", "first character"),
            ("間", "second character"),
            ("房子", "shares 房"),
            ("時間", "shares 間"),
            ("空間", "shares 間"),
        ]),
    );
    let harness = helpers::build_harness(fakes);
    let entity = factories::entity("房間");
    harness.save(&entity).await;

    harness
        .pipeline
        .enrich(&request(entity.id), &LeaseGuard::detached(), &NoProgress)
        .await
        .unwrap();

    let confusions = harness.load(entity.id).await.confusions.unwrap();
    let keys: Vec<&str> = confusions.iter().map(|entry| entry.key.as_str()).collect();
    assert_eq!(keys, vec!["房子", "時間", "空間"]);
}

#[tokio::test]
async fn insights_without_origin_are_rejected() {
    let fakes = FakeCollaborators::new()
        .with_insights("木", factories::insights_without_origin("木"));
    let harness = helpers::build_harness(fakes);
    let entity = factories::entity("木");
    harness.save(&entity).await;

    let report = harness
        .pipeline
        .enrich(&request(entity.id), &LeaseGuard::detached(), &NoProgress)
        .await
        .unwrap();

    let stored = harness.load(entity.id).await;
    assert!(stored.insights.is_none());
    assert!(stored.insights_generated_at.is_none());
    assert!(!stored.has_insights());
    assert!(!report.has_insights);
}

#[tokio::test]
async fn rejected_refresh_keeps_previous_insights() {
    let harness = helpers::build_harness(
        FakeCollaborators::new().with_insights("土", factories::insights_without_origin("土")),
    );
    let mut entity = factories::entity("土");
    let previous = factories::valid_insights("土");
    entity.insights = Some(previous.clone());
    harness.save(&entity).await;

    let report = harness
        .pipeline
        .refresh_insights(&request(entity.id), &LeaseGuard::detached(), &NoProgress)
        .await
        .unwrap();

    assert!(report.has_insights);
    assert!(matches!(
        report.outcome(Stage::Insights),
        Some(StageOutcome::Discarded(_))
    ));
    assert_eq!(harness.load(entity.id).await.insights, Some(previous));
    assert_eq!(harness.collaborators.calls.insights.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refresh_finishing_after_enrichment_keeps_enriched_fields() {
    let mut fresh = factories::valid_insights("水");
    fresh.etymology.origin = "Three drops beside a stream".to_string();
    let harness = helpers::build_harness(
        FakeCollaborators::new()
            .with_dictionary("水", vec![factories::dictionary_entry("水", "shui3", &["water"])])
            .with_insights("水", fresh.clone()),
    );
    let mut entity = factories::entity("水");
    entity.insights = Some(factories::valid_insights("水"));
    harness.save(&entity).await;

    let gate = harness.collaborators.hold("insights");
    let pipeline = harness.pipeline.clone();
    let entity_id = entity.id;
    let refresh = tokio::spawn(async move {
        pipeline
            .refresh_insights(&request(entity_id), &LeaseGuard::detached(), &NoProgress)
            .await
    });
    wait_for_call(&harness.collaborators.calls.insights, 1).await;

    // Insights already exist, so this run never reaches the held generator
    let enriched = harness
        .pipeline
        .enrich(&request(entity.id), &LeaseGuard::detached(), &NoProgress)
        .await
        .unwrap();
    assert!(enriched.cached);

    gate.add_permits(1);
    let refreshed = refresh.await.unwrap().unwrap();
    assert_eq!(refreshed.outcome(Stage::Insights), Some(&StageOutcome::Completed));
    assert!(refreshed.cached);

    let stored = harness.load(entity.id).await;
    assert_eq!(stored.pronunciation.as_deref(), Some("shui3"));
    assert_eq!(stored.gloss.as_deref(), Some("water"));
    assert!(stored.confusions.is_some());
    assert!(stored.image.is_some());
    assert!(stored.audio.is_some());
    assert_eq!(stored.insights, Some(fresh));
    assert!(stored.insights_generated_at.is_some());
    assert!(stored.cached);
}

#[tokio::test]
async fn enrichment_finishing_after_refresh_keeps_new_insights() {
    let mut fresh = factories::valid_insights("火");
    fresh.etymology.origin = "Flames rising from a hearth".to_string();
    let harness = helpers::build_harness(
        FakeCollaborators::new()
            .with_dictionary("火", vec![factories::dictionary_entry("火", "huo3", &["fire"])])
            .with_insights("火", fresh.clone()),
    );
    let mut entity = factories::entity("火");
    entity.insights = Some(factories::valid_insights("火"));
    harness.save(&entity).await;

    let gate = harness.collaborators.hold("image");
    let pipeline = harness.pipeline.clone();
    let entity_id = entity.id;
    let enrichment = tokio::spawn(async move {
        pipeline
            .enrich(&request(entity_id), &LeaseGuard::detached(), &NoProgress)
            .await
    });
    wait_for_call(&harness.collaborators.calls.image, 1).await;

    let refreshed = harness
        .pipeline
        .refresh_insights(&request(entity.id), &LeaseGuard::detached(), &NoProgress)
        .await
        .unwrap();
    // Enrichment has not finished, so the refresh cannot mark it cached
    assert!(!refreshed.cached);

    gate.add_permits(1);
    let enriched = enrichment.await.unwrap().unwrap();
    assert!(enriched.cached);

    let stored = harness.load(entity.id).await;
    assert_eq!(stored.pronunciation.as_deref(), Some("huo3"));
    assert!(stored.image.is_some());
    assert_eq!(stored.insights, Some(fresh));
    assert!(stored.cached);
}

// ================================================================================================
// MEDIA
// ================================================================================================

#[tokio::test]
async fn entities_sharing_a_key_share_generated_media() {
    let harness = helpers::build_harness(FakeCollaborators::new());
    let first = factories::entity("月");
    let second = factories::entity("月");
    harness.save(&first).await;
    harness.save(&second).await;

    let (first_request, second_request) = (request(first.id), request(second.id));
    let (first_lease, second_lease) = (LeaseGuard::detached(), LeaseGuard::detached());
    let (a, b) = tokio::join!(
        harness
            .pipeline
            .enrich(&first_request, &first_lease, &NoProgress),
        harness
            .pipeline
            .enrich(&second_request, &second_lease, &NoProgress),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(harness.collaborators.calls.image.load(Ordering::SeqCst), 1);
    assert_eq!(harness.collaborators.calls.audio.load(Ordering::SeqCst), 1);

    let first = harness.load(first.id).await;
    let second = harness.load(second.id).await;
    assert_eq!(first.image, second.image);
    assert_eq!(
        harness.media.inner.bytes("月", MediaKind::Audio).await,
        Some("audio of 月".as_bytes().to_vec())
    );
}

#[tokio::test]
async fn lost_lease_stops_all_writes() {
    let harness = helpers::build_harness(FakeCollaborators::new());
    let entity = factories::entity("雨");
    harness.save(&entity).await;

    let lease = LeaseGuard::detached();
    lease.mark_lost();

    let err = harness
        .pipeline
        .enrich(&request(entity.id), &lease, &NoProgress)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        hanzi_enrichment::shared::AppError::LockLost(_)
    ));
    let stored = harness.load(entity.id).await;
    assert!(stored.pronunciation.is_none());
    assert!(stored.gloss.is_none());
}

#[tokio::test]
async fn media_stored_by_another_process_is_linked_not_regenerated() {
    let harness = helpers::build_harness(FakeCollaborators::new());
    let first = factories::entity("星");
    let second = factories::entity("星");
    harness.save(&first).await;
    harness.save(&second).await;

    harness
        .pipeline
        .enrich(&request(first.id), &LeaseGuard::detached(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(harness.collaborators.calls.image.load(Ordering::SeqCst), 1);
    let writes = harness.media.writes.load(Ordering::SeqCst);

    // Same media store, but its own locks and memo, like a second worker process
    let other_process = EnrichmentPipeline::new(
        Arc::new(harness.repository.clone()),
        Collaborators::from_gateway(harness.collaborators.clone()),
        harness.media.clone(),
        helpers::generous_limiters(),
        harness.clock.clone(),
    );
    // Snapshot taken before the first run stored anything
    let stale = Prefetched {
        dictionary: Prefetch::NotFetched,
        media: Prefetch::Fetched(ExistingMedia::default()),
    };
    let report = other_process
        .enrich_entity(
            harness.load(second.id).await,
            &request(second.id),
            stale,
            &LeaseGuard::detached(),
            &NoProgress,
        )
        .await
        .unwrap();

    assert_eq!(report.outcome(Stage::Image), Some(&StageOutcome::Completed));
    assert_eq!(harness.collaborators.calls.image.load(Ordering::SeqCst), 1);
    assert_eq!(harness.collaborators.calls.audio.load(Ordering::SeqCst), 1);
    assert_eq!(harness.media.writes.load(Ordering::SeqCst), writes);

    let first = harness.load(first.id).await;
    let second = harness.load(second.id).await;
    assert_eq!(first.image, second.image);
    assert_eq!(first.audio, second.audio);
}
