use anyhow::{bail, Context};
use hanzi_enrichment::modules::enrichment::infrastructure::{
    CollaboratorEndpoints, FsMediaStore, HttpCollaboratorGateway, InMemoryEntityRepository,
};
use hanzi_enrichment::modules::enrichment::{
    BatchConfig, BatchProcessor, Collaborators, EnrichmentJobHandler, EnrichmentPipeline,
    EnrichmentService, EntityRepository, MediaStore,
};
use hanzi_enrichment::modules::jobs::{
    queues, InMemoryJobStore, JobStore, RetentionPolicy, Worker, WorkerConfig,
};
use hanzi_enrichment::modules::monitoring::HealthMonitor;
use hanzi_enrichment::modules::rate_limit::{InMemoryTokenStore, ServiceRateLimiters, TokenStore};
use hanzi_enrichment::shared::utils::{init_logger, SharedClock, SystemClock};
use hanzi_enrichment::shared::AppConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

struct Stores {
    jobs: Arc<dyn JobStore>,
    entities: Arc<dyn EntityRepository>,
    tokens: Arc<dyn TokenStore>,
}

fn build_stores(config: &AppConfig, clock: SharedClock) -> anyhow::Result<Stores> {
    let retention = RetentionPolicy::with_max_age_days(config.job_retention_days);

    if let Some(url) = config.database_url.as_deref() {
        #[cfg(feature = "postgres")]
        {
            use hanzi_enrichment::modules::enrichment::infrastructure::PgEntityRepository;
            use hanzi_enrichment::modules::jobs::PgJobStore;
            use hanzi_enrichment::modules::rate_limit::infrastructure::PgTokenStore;
            use hanzi_enrichment::shared::infrastructure::Database;

            let database = Database::new(url).context("connecting to Postgres")?;
            database
                .run_pending_migrations()
                .context("running database migrations")?;
            log::info!("Using Postgres job store and entity repository");

            return Ok(Stores {
                jobs: Arc::new(PgJobStore::new(database.clone()).with_retention(retention)),
                entities: Arc::new(PgEntityRepository::new(database.clone())),
                tokens: Arc::new(PgTokenStore::new(database)),
            });
        }

        #[cfg(not(feature = "postgres"))]
        {
            let _ = url;
            log::warn!("DATABASE_URL is set but this build has no postgres feature; using in-memory stores");
        }
    }

    Ok(Stores {
        jobs: Arc::new(InMemoryJobStore::with_clock(clock.clone()).with_retention(retention)),
        entities: Arc::new(InMemoryEntityRepository::new()),
        tokens: Arc::new(InMemoryTokenStore::with_clock(clock)),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let config = AppConfig::from_env().context("loading configuration")?;
    let clock: SharedClock = Arc::new(SystemClock);

    let Some(base_url) = config.collaborator_base_url.as_deref() else {
        bail!("COLLABORATOR_BASE_URL must be set");
    };

    let stores = build_stores(&config, clock.clone())?;
    let limiters = ServiceRateLimiters::from_settings(&config.rate_limits, Some(stores.tokens.clone()))
        .context("building rate limiters")?;

    let gateway = Arc::new(HttpCollaboratorGateway::new(CollaboratorEndpoints::from_base_url(
        base_url,
    )?)?);
    let collaborators = Collaborators::from_gateway(gateway);
    let media: Arc<dyn MediaStore> = Arc::new(FsMediaStore::new(&config.media_dir));

    let pipeline = Arc::new(EnrichmentPipeline::new(
        stores.entities.clone(),
        collaborators.clone(),
        media.clone(),
        limiters,
        clock.clone(),
    ));
    let handler = Arc::new(EnrichmentJobHandler::new(pipeline.clone()));

    let monitor = Arc::new(HealthMonitor::new(stores.jobs.clone(), clock.clone()));
    let shutdown = CancellationToken::new();

    // One worker per queue
    let enrichment_config = WorkerConfig::from_settings(&config.worker);
    let mut insights_config = WorkerConfig::from_settings(&config.worker);
    insights_config.name = format!("{}-insights", config.worker.name);
    insights_config.queue = queues::INSIGHTS.to_string();

    let mut workers = Vec::new();
    for worker_config in [enrichment_config, insights_config] {
        monitor.register(&worker_config.name);
        let worker = Worker::new(worker_config, stores.jobs.clone(), handler.clone())?
            .with_observer(monitor.clone());
        log::info!("Starting worker {}", worker.name());
        workers.push(worker.spawn());
    }

    let batch_name = format!("{}-batch", config.worker.name);
    monitor.register(&batch_name);
    let batch = Arc::new(
        BatchProcessor::new(
            &batch_name,
            pipeline,
            stores.entities.clone(),
            collaborators.dictionary.clone(),
            media,
            clock.clone(),
            BatchConfig::from_settings(&config.batch),
        )?
        .with_observer(monitor.clone()),
    );
    let batch_task = batch.spawn(
        stores.jobs.clone(),
        &config.worker.queue,
        config.worker.lock_duration,
        shutdown.clone(),
    );

    let ping_task = monitor.start_self_ping(config.health.ping_interval, shutdown.clone());

    let service = Arc::new(EnrichmentService::new(
        stores.jobs.clone(),
        stores.entities.clone(),
        clock.clone(),
    ));
    let retention_days = config.job_retention_days;
    let retention_shutdown = shutdown.clone();
    let retention_service = service.clone();
    let retention_task = tokio::spawn(async move {
        let mut ticks = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    if let Err(e) = retention_service.cleanup_finished(retention_days).await {
                        log::warn!("Retention sweep failed: {}", e);
                    }
                }
                _ = retention_shutdown.cancelled() => break,
            }
        }
    });

    log::info!("enrichment-worker running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    log::info!("Shutdown requested, draining in-flight jobs");

    shutdown.cancel();
    for worker in workers {
        let name = worker.name().to_string();
        if let Err(e) = worker.shutdown().await {
            log::error!("Worker {} did not shut down cleanly: {}", name, e);
        }
    }
    for (task, name) in [
        (batch_task, "batch loop"),
        (ping_task, "health ping"),
        (retention_task, "retention sweep"),
    ] {
        if let Err(e) = task.await {
            log::error!("{} task ended abnormally: {}", name, e);
        }
    }

    let report = monitor.health_report(config.health.max_age).await;
    log::info!("Final health: {:?}", report.status);
    match service.queue_statistics().await {
        Ok(statistics) => {
            for (queue, stats) in statistics {
                log::info!("Queue '{}' at shutdown: {:?}", queue, stats);
            }
        }
        Err(e) => log::warn!("Could not read queue statistics: {}", e),
    }

    Ok(())
}
