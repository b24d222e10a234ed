/// Token buckets kept in Postgres so every worker process shares them.
///
/// Refill arithmetic runs inside the statement against `NOW()`, so the
/// database clock is the only clock involved.
use crate::modules::rate_limit::domain::{BucketLimits, TokenStore};
use crate::shared::errors::AppResult;
use crate::shared::infrastructure::database::Database;
use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sql_types::{Double, Text};

#[derive(QueryableByName)]
struct Granted {
    #[diesel(sql_type = diesel::sql_types::Bool)]
    granted: bool,
}

#[derive(QueryableByName)]
struct Balance {
    #[diesel(sql_type = Double)]
    tokens: f64,
}

pub struct PgTokenStore {
    db: Database,
}

impl PgTokenStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

/// Balance after crediting the time since `last_refill`, capped at `burst`
fn refilled(burst: &str, rate_per_second: &str) -> String {
    format!(
        "LEAST({burst}, tokens + GREATEST(0, EXTRACT(EPOCH FROM (NOW() - last_refill)))::float8 * {rate_per_second})"
    )
}

fn acquire_sql() -> String {
    format!(
        "WITH current AS (
             SELECT bucket_key, {} AS refilled
             FROM rate_limit_buckets
             WHERE bucket_key = $1
             FOR UPDATE
         )
         UPDATE rate_limit_buckets b
         SET tokens = CASE WHEN c.refilled >= $4 THEN c.refilled - $4 ELSE c.refilled END,
             last_refill = GREATEST(b.last_refill, NOW()),
             burst = $2,
             rate_per_second = $3
         FROM current c
         WHERE b.bucket_key = c.bucket_key
         RETURNING (c.refilled >= $4) AS granted",
        refilled("$2", "$3")
    )
}

fn available_sql() -> String {
    format!(
        "SELECT {} AS tokens FROM rate_limit_buckets WHERE bucket_key = $1",
        refilled("burst", "rate_per_second")
    )
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn acquire(&self, key: &str, cost: u32, limits: BucketLimits) -> AppResult<bool> {
        limits.check_cost(cost)?;
        let key = key.to_string();

        self.db
            .run(move |conn| {
                conn.transaction(|conn| {
                    diesel::sql_query(
                        "INSERT INTO rate_limit_buckets
                             (bucket_key, tokens, last_refill, burst, rate_per_second)
                         VALUES ($1, $2, NOW(), $2, $3)
                         ON CONFLICT (bucket_key) DO NOTHING",
                    )
                    .bind::<Text, _>(key.as_str())
                    .bind::<Double, _>(limits.burst as f64)
                    .bind::<Double, _>(limits.rate_per_second)
                    .execute(conn)?;

                    let row: Granted = diesel::sql_query(acquire_sql())
                        .bind::<Text, _>(key.as_str())
                        .bind::<Double, _>(limits.burst as f64)
                        .bind::<Double, _>(limits.rate_per_second)
                        .bind::<Double, _>(cost as f64)
                        .get_result(conn)?;

                    Ok(row.granted)
                })
            })
            .await
    }

    async fn available(&self, key: &str) -> AppResult<Option<f64>> {
        let key = key.to_string();

        self.db
            .run(move |conn| {
                let row: Option<Balance> = diesel::sql_query(available_sql())
                    .bind::<Text, _>(key.as_str())
                    .get_result(conn)
                    .optional()?;
                Ok(row.map(|r| r.tokens))
            })
            .await
    }
}
