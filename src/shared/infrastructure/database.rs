use crate::log_info;
use crate::shared::errors::{AppError, AppResult};
use crate::shared::utils::logger::LogContext;
use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::time::{Duration, Instant};

type PgPool = Pool<ConnectionManager<PgConnection>>;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Checkouts slower than this get logged
const SLOW_CHECKOUT_MS: u64 = 100;

/// Shared Postgres pool for the job store, token store and entity repository.
///
/// Diesel is synchronous; async callers go through [`Database::run`].
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(database_url: &str) -> AppResult<Self> {
        Self::with_max_connections(database_url, default_max_connections())
    }

    pub fn with_max_connections(database_url: &str, max_connections: u32) -> AppResult<Self> {
        if !(database_url.starts_with("postgres://") || database_url.starts_with("postgresql://")) {
            return Err(AppError::ConfigurationError(
                "DATABASE_URL must start with postgres:// or postgresql://".to_string(),
            ));
        }
        log_info!("Connecting to Postgres at {}", redact(database_url));

        let max_connections = max_connections.max(1);
        let min_idle = (max_connections / 4).max(1);
        let pool = Pool::builder()
            .max_size(max_connections)
            .min_idle(Some(min_idle))
            .connection_timeout(Duration::from_secs(10))
            .idle_timeout(Some(Duration::from_secs(300)))
            .test_on_check_out(true)
            .build(ConnectionManager::<PgConnection>::new(database_url))
            .map_err(|e| AppError::DatabaseError(format!("Failed to build pool: {}", e)))?;

        log_info!(
            "Postgres pool ready ({} max, {} idle)",
            max_connections,
            min_idle
        );
        Ok(Self { pool })
    }

    fn checkout(&self) -> AppResult<PooledConnection<ConnectionManager<PgConnection>>> {
        let started = Instant::now();
        let conn = self.pool.get()?;
        let waited = started.elapsed().as_millis() as u64;
        if waited > SLOW_CHECKOUT_MS {
            LogContext::performance_metric("pool checkout", waited, Some("slow"));
        }
        Ok(conn)
    }

    /// Run a blocking diesel closure on the blocking thread pool
    pub async fn run<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> AppResult<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.checkout()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| AppError::InternalError(format!("Database task panicked: {}", e)))?
    }

    pub fn run_pending_migrations(&self) -> AppResult<()> {
        let mut conn = self.checkout()?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| AppError::DatabaseError(format!("Migrations failed: {}", e)))?;
        log_info!("Applied {} pending migration(s)", applied.len());
        Ok(())
    }
}

/// One process runs a handful of handlers; the rest of the fleet has its own pools.
fn default_max_connections() -> u32 {
    let cpus = std::thread::available_parallelism().map_or(4, |n| n.get());
    (cpus * 2).min(16) as u32
}

/// Host part only, never the credentials
fn redact(database_url: &str) -> &str {
    database_url
        .rsplit_once('@')
        .map_or("<unknown host>", |(_, host)| host)
}
