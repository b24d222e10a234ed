/// Diesel-based implementation of JobStore
///
/// Uses PostgreSQL with SELECT FOR UPDATE SKIP LOCKED for atomic dequeuing.
/// Every timestamp comes from the database's `NOW()` so worker processes never
/// disagree about lock expiry.
use crate::modules::jobs::domain::entities::{
    JobProgress, JobRecord, JobState, NewJob, RetentionPolicy,
};
use crate::modules::jobs::domain::repository::{JobStatistics, JobStore};
use crate::modules::jobs::infrastructure::models::{JobModel, JOB_COLUMNS};
use crate::shared::errors::{AppError, AppResult};
use crate::shared::infrastructure::database::Database;
use crate::shared::utils::logger::LogContext;
use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bool, Integer, Jsonb, Nullable, Text};
use diesel::PgConnection;
use std::time::Duration;
use uuid::Uuid;

/// Helper struct for the statistics query
#[derive(QueryableByName)]
struct CountsRow {
    #[diesel(sql_type = BigInt)]
    waiting_count: i64,
    #[diesel(sql_type = BigInt)]
    delayed_count: i64,
    #[diesel(sql_type = BigInt)]
    active_count: i64,
    #[diesel(sql_type = BigInt)]
    completed_count: i64,
    #[diesel(sql_type = BigInt)]
    failed_count: i64,
    #[diesel(sql_type = BigInt)]
    total_count: i64,
}

#[derive(QueryableByName)]
struct PingRow {
    #[diesel(sql_type = Bool)]
    #[allow(dead_code)]
    ok: bool,
}

pub struct PgJobStore {
    db: Database,
    retention: RetentionPolicy,
}

impl PgJobStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    fn millis(duration: Duration) -> i64 {
        duration.as_millis().min(i64::MAX as u128) as i64
    }

    fn lock_lost(job_id: Uuid) -> AppError {
        AppError::LockLost(format!("job {} is no longer locked by this worker", job_id))
    }

    fn select_by_id(conn: &mut PgConnection, job_id: Uuid) -> AppResult<Option<JobModel>> {
        let row = diesel::sql_query(format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS))
            .bind::<diesel::sql_types::Uuid, _>(job_id)
            .get_result::<JobModel>(conn)
            .optional()?;
        Ok(row)
    }

    fn sweep_expired(conn: &mut PgConnection, queue: &str) -> AppResult<usize> {
        let touched = diesel::sql_query(
            "UPDATE jobs
             SET attempts_made = attempts_made + 1,
                 failed_reason = 'lock expired',
                 lock_token = NULL,
                 lock_expires_at = NULL,
                 state = CASE WHEN attempts_made + 1 < max_attempts
                              THEN 'waiting'::job_state ELSE 'failed'::job_state END,
                 payload = CASE WHEN attempts_made + 1 < max_attempts
                                THEN COALESCE(follow_up, payload) ELSE payload END,
                 follow_up = CASE WHEN attempts_made + 1 < max_attempts
                                  THEN NULL ELSE follow_up END,
                 available_at = NOW(),
                 finished_at = CASE WHEN attempts_made + 1 < max_attempts
                                    THEN NULL ELSE NOW() END
             WHERE queue = $1
               AND state = 'active'
               AND (lock_expires_at IS NULL OR lock_expires_at <= NOW())",
        )
        .bind::<Text, _>(queue)
        .execute(conn)?;

        if touched > 0 {
            Self::release_follow_ups(conn, queue)?;
        }
        Ok(touched)
    }

    /// Queue the follow-ups of finished jobs as fresh waiting jobs
    fn release_follow_ups(conn: &mut PgConnection, queue: &str) -> AppResult<usize> {
        let queued = diesel::sql_query(
            "INSERT INTO jobs (id, queue, job_type, payload, priority, state, attempts_made,
                               max_attempts, backoff, dedupe_key, available_at, created_at)
             SELECT gen_random_uuid(), queue, job_type, follow_up, priority, 'waiting', 0,
                    max_attempts, backoff, dedupe_key, NOW(), NOW()
             FROM jobs
             WHERE queue = $1
               AND state IN ('completed', 'failed')
               AND follow_up IS NOT NULL
             ON CONFLICT DO NOTHING",
        )
        .bind::<Text, _>(queue)
        .execute(conn)?;

        if queued > 0 {
            diesel::sql_query(
                "UPDATE jobs SET follow_up = NULL
                 WHERE queue = $1
                   AND state IN ('completed', 'failed')
                   AND follow_up IS NOT NULL",
            )
            .bind::<Text, _>(queue)
            .execute(conn)?;
        }
        Ok(queued)
    }

    fn apply_retention(
        conn: &mut PgConnection,
        retention: RetentionPolicy,
        queue: &str,
    ) -> AppResult<usize> {
        let mut removed = 0;

        for (state, keep) in [
            ("completed", retention.keep_completed),
            ("failed", retention.keep_failed),
        ] {
            removed += diesel::sql_query(
                "DELETE FROM jobs WHERE id IN (
                     SELECT id FROM jobs
                     WHERE queue = $1 AND state = $2::job_state
                     ORDER BY finished_at DESC
                     OFFSET $3
                 )",
            )
            .bind::<Text, _>(queue)
            .bind::<Text, _>(state)
            .bind::<BigInt, _>(keep as i64)
            .execute(conn)?;
        }

        if let Some(max_age) = retention.max_age {
            removed += diesel::sql_query(
                "DELETE FROM jobs
                 WHERE queue = $1
                   AND state IN ('completed', 'failed')
                   AND finished_at < NOW() - ($2 * INTERVAL '1 millisecond')",
            )
            .bind::<Text, _>(queue)
            .bind::<BigInt, _>(Self::millis(max_age))
            .execute(conn)?;
        }

        Ok(removed)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: NewJob) -> AppResult<JobRecord> {
        let backoff = serde_json::to_value(job.options.backoff)?;

        let model = self
            .db
            .run(move |conn| {
                conn.transaction(|conn| {
                    let inserted = diesel::sql_query(format!(
                        "INSERT INTO jobs (id, queue, job_type, payload, priority, state,
                                           attempts_made, max_attempts, backoff, dedupe_key,
                                           available_at, created_at)
                         VALUES ($1, $2, $3, $4, $5, 'waiting', 0, $6, $7, $8,
                                 NOW() + ($9 * INTERVAL '1 millisecond'), NOW())
                         ON CONFLICT (queue, dedupe_key)
                             WHERE dedupe_key IS NOT NULL AND state IN ('waiting', 'active')
                             DO NOTHING
                         RETURNING {}",
                        JOB_COLUMNS
                    ))
                    .bind::<diesel::sql_types::Uuid, _>(Uuid::new_v4())
                    .bind::<Text, _>(job.queue.as_str())
                    .bind::<Text, _>(job.job_type.to_string())
                    .bind::<Jsonb, _>(job.payload.clone())
                    .bind::<Integer, _>(job.options.priority)
                    .bind::<Integer, _>(job.options.max_attempts.max(1) as i32)
                    .bind::<Jsonb, _>(backoff)
                    .bind::<Nullable<Text>, _>(job.options.dedupe_key.as_deref())
                    .bind::<BigInt, _>(Self::millis(job.options.delay))
                    .get_result::<JobModel>(conn)
                    .optional()?;

                    if let Some(model) = inserted {
                        return Ok(model);
                    }

                    if !job.options.supersede {
                        // Lost the dedupe race: hand back the outstanding job
                        return diesel::sql_query(format!(
                            "SELECT {} FROM jobs
                             WHERE queue = $1 AND dedupe_key = $2
                               AND state IN ('waiting', 'active')
                             LIMIT 1",
                            JOB_COLUMNS
                        ))
                        .bind::<Text, _>(job.queue.as_str())
                        .bind::<Nullable<Text>, _>(job.options.dedupe_key.as_deref())
                        .get_result::<JobModel>(conn)
                        .map_err(AppError::from);
                    }

                    // A waiting job takes the new payload; an active one
                    // keeps it for a follow-up run
                    diesel::sql_query(format!(
                        "UPDATE jobs
                         SET payload = CASE WHEN state = 'waiting' THEN $3 ELSE payload END,
                             follow_up = CASE WHEN state = 'active' THEN $3 ELSE follow_up END,
                             priority = GREATEST(priority, $4)
                         WHERE queue = $1 AND dedupe_key = $2
                           AND state IN ('waiting', 'active')
                         RETURNING {}",
                        JOB_COLUMNS
                    ))
                    .bind::<Text, _>(job.queue.as_str())
                    .bind::<Nullable<Text>, _>(job.options.dedupe_key.as_deref())
                    .bind::<Jsonb, _>(job.payload.clone())
                    .bind::<Integer, _>(job.options.priority)
                    .get_result::<JobModel>(conn)
                    .map_err(AppError::from)
                })
            })
            .await?;

        model.into_record()
    }

    async fn dequeue(
        &self,
        queue: &str,
        lock_token: Uuid,
        lock_duration: Duration,
    ) -> AppResult<Option<JobRecord>> {
        let queue = queue.to_string();
        let retention = self.retention;
        let lock_ms = Self::millis(lock_duration);

        let model = self
            .db
            .run(move |conn| {
                conn.transaction(|conn| {
                    if Self::sweep_expired(conn, &queue)? > 0 {
                        Self::apply_retention(conn, retention, &queue)?;
                    }

                    let row = diesel::sql_query(format!(
                        "UPDATE jobs
                         SET state = 'active',
                             lock_token = $2,
                             lock_expires_at = NOW() + ($3 * INTERVAL '1 millisecond'),
                             started_at = NOW()
                         WHERE id = (
                             SELECT id
                             FROM jobs
                             WHERE queue = $1
                               AND state = 'waiting'
                               AND available_at <= NOW()
                             ORDER BY priority DESC, enqueue_seq ASC
                             LIMIT 1
                             FOR UPDATE SKIP LOCKED
                         )
                         RETURNING {}",
                        JOB_COLUMNS
                    ))
                    .bind::<Text, _>(queue.as_str())
                    .bind::<diesel::sql_types::Uuid, _>(lock_token)
                    .bind::<BigInt, _>(lock_ms)
                    .get_result::<JobModel>(conn)
                    .optional()?;

                    Ok(row)
                })
            })
            .await?;

        match model {
            Some(model) => {
                let record = model.into_record()?;
                LogContext::job_transition(&record.queue, &record.id, "waiting", "active");
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn mark_active(
        &self,
        job_id: Uuid,
        lock_token: Uuid,
        lock_duration: Duration,
    ) -> AppResult<JobRecord> {
        let lock_ms = Self::millis(lock_duration);

        let model = self
            .db
            .run(move |conn| {
                let row = diesel::sql_query(format!(
                    "UPDATE jobs
                     SET state = 'active',
                         lock_token = $2,
                         lock_expires_at = NOW() + ($3 * INTERVAL '1 millisecond'),
                         started_at = NOW()
                     WHERE id = $1 AND state = 'waiting' AND available_at <= NOW()
                     RETURNING {}",
                    JOB_COLUMNS
                ))
                .bind::<diesel::sql_types::Uuid, _>(job_id)
                .bind::<diesel::sql_types::Uuid, _>(lock_token)
                .bind::<BigInt, _>(lock_ms)
                .get_result::<JobModel>(conn)
                .optional()?;

                match row {
                    Some(model) => Ok(model),
                    None => match Self::select_by_id(conn, job_id)? {
                        Some(existing) => Err(AppError::InvalidInput(format!(
                            "Job {} cannot be activated while {}",
                            job_id,
                            JobState::from(existing.state)
                        ))),
                        None => Err(AppError::NotFound(format!("Job {} not found", job_id))),
                    },
                }
            })
            .await?;

        model.into_record()
    }

    async fn renew_lock(
        &self,
        job_id: Uuid,
        lock_token: Uuid,
        lock_duration: Duration,
    ) -> AppResult<()> {
        let lock_ms = Self::millis(lock_duration);

        let updated = self
            .db
            .run(move |conn| {
                let updated = diesel::sql_query(
                    "UPDATE jobs
                     SET lock_expires_at = NOW() + ($3 * INTERVAL '1 millisecond')
                     WHERE id = $1
                       AND state = 'active'
                       AND lock_token = $2
                       AND lock_expires_at > NOW()",
                )
                .bind::<diesel::sql_types::Uuid, _>(job_id)
                .bind::<diesel::sql_types::Uuid, _>(lock_token)
                .bind::<BigInt, _>(lock_ms)
                .execute(conn)?;
                Ok(updated)
            })
            .await?;

        if updated == 0 {
            return Err(Self::lock_lost(job_id));
        }
        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        lock_token: Uuid,
        result: serde_json::Value,
    ) -> AppResult<JobRecord> {
        let retention = self.retention;

        let model = self
            .db
            .run(move |conn| {
                conn.transaction(|conn| {
                    let row = diesel::sql_query(format!(
                        "UPDATE jobs
                         SET state = 'completed',
                             result = $3,
                             failed_reason = NULL,
                             lock_token = NULL,
                             lock_expires_at = NULL,
                             finished_at = NOW()
                         WHERE id = $1
                           AND state = 'active'
                           AND lock_token = $2
                           AND lock_expires_at > NOW()
                         RETURNING {}",
                        JOB_COLUMNS
                    ))
                    .bind::<diesel::sql_types::Uuid, _>(job_id)
                    .bind::<diesel::sql_types::Uuid, _>(lock_token)
                    .bind::<Jsonb, _>(result)
                    .get_result::<JobModel>(conn)
                    .optional()?
                    .ok_or_else(|| Self::lock_lost(job_id))?;

                    Self::release_follow_ups(conn, &row.queue)?;
                    Self::apply_retention(conn, retention, &row.queue)?;
                    Ok(row)
                })
            })
            .await?;

        let record = model.into_record()?;
        LogContext::job_transition(&record.queue, &job_id, "active", "completed");
        Ok(record)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        lock_token: Uuid,
        reason: &str,
        retryable: bool,
    ) -> AppResult<JobRecord> {
        let reason = reason.to_string();
        let retention = self.retention;

        let model = self
            .db
            .run(move |conn| {
                conn.transaction(|conn| {
                    let current = diesel::sql_query(format!(
                        "SELECT {} FROM jobs
                         WHERE id = $1
                           AND state = 'active'
                           AND lock_token = $2
                           AND lock_expires_at > NOW()
                         FOR UPDATE",
                        JOB_COLUMNS
                    ))
                    .bind::<diesel::sql_types::Uuid, _>(job_id)
                    .bind::<diesel::sql_types::Uuid, _>(lock_token)
                    .get_result::<JobModel>(conn)
                    .optional()?
                    .ok_or_else(|| Self::lock_lost(job_id))?
                    .into_record()?;

                    let attempts_made = current.attempts_made + 1;
                    let retry = retryable && attempts_made < current.max_attempts;
                    let delay = if retry {
                        current.backoff.delay_with_jitter(&job_id, attempts_made)
                    } else {
                        Duration::ZERO
                    };

                    let row = diesel::sql_query(format!(
                        "UPDATE jobs
                         SET attempts_made = $2,
                             failed_reason = $3,
                             lock_token = NULL,
                             lock_expires_at = NULL,
                             state = CASE WHEN $4 THEN 'waiting'::job_state
                                          ELSE 'failed'::job_state END,
                             payload = CASE WHEN $4 THEN COALESCE(follow_up, payload)
                                            ELSE payload END,
                             follow_up = CASE WHEN $4 THEN NULL ELSE follow_up END,
                             available_at = CASE WHEN $4
                                                 THEN NOW() + ($5 * INTERVAL '1 millisecond')
                                                 ELSE available_at END,
                             finished_at = CASE WHEN $4 THEN NULL ELSE NOW() END
                         WHERE id = $1
                         RETURNING {}",
                        JOB_COLUMNS
                    ))
                    .bind::<diesel::sql_types::Uuid, _>(job_id)
                    .bind::<Integer, _>(attempts_made as i32)
                    .bind::<Text, _>(reason.as_str())
                    .bind::<Bool, _>(retry)
                    .bind::<BigInt, _>(Self::millis(delay))
                    .get_result::<JobModel>(conn)?;

                    if !retry {
                        Self::release_follow_ups(conn, &row.queue)?;
                        Self::apply_retention(conn, retention, &row.queue)?;
                    }
                    Ok(row)
                })
            })
            .await?;

        let record = model.into_record()?;
        LogContext::job_transition(&record.queue, &job_id, "active", &record.state.to_string());
        Ok(record)
    }

    async fn update_progress(&self, job_id: Uuid, progress: JobProgress) -> AppResult<()> {
        let progress = serde_json::to_value(progress)?;

        let updated = self
            .db
            .run(move |conn| {
                let updated = diesel::sql_query("UPDATE jobs SET progress = $2 WHERE id = $1")
                    .bind::<diesel::sql_types::Uuid, _>(job_id)
                    .bind::<Jsonb, _>(progress)
                    .execute(conn)?;
                Ok(updated)
            })
            .await?;

        if updated == 0 {
            return Err(AppError::NotFound(format!("Job {} not found", job_id)));
        }
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> AppResult<Option<JobRecord>> {
        let model = self
            .db
            .run(move |conn| Self::select_by_id(conn, job_id))
            .await?;
        model.map(JobModel::into_record).transpose()
    }

    async fn find_outstanding(
        &self,
        queue: &str,
        dedupe_key: &str,
    ) -> AppResult<Option<JobRecord>> {
        let queue = queue.to_string();
        let dedupe_key = dedupe_key.to_string();

        let model = self
            .db
            .run(move |conn| {
                let row = diesel::sql_query(format!(
                    "SELECT {} FROM jobs
                     WHERE queue = $1 AND dedupe_key = $2 AND state IN ('waiting', 'active')
                     LIMIT 1",
                    JOB_COLUMNS
                ))
                .bind::<Text, _>(queue.as_str())
                .bind::<Text, _>(dedupe_key.as_str())
                .get_result::<JobModel>(conn)
                .optional()?;
                Ok(row)
            })
            .await?;

        model.map(JobModel::into_record).transpose()
    }

    async fn requeue_expired(&self, queue: &str) -> AppResult<usize> {
        let queue = queue.to_string();
        let retention = self.retention;

        self.db
            .run(move |conn| {
                conn.transaction(|conn| {
                    let touched = Self::sweep_expired(conn, &queue)?;
                    if touched > 0 {
                        Self::apply_retention(conn, retention, &queue)?;
                    }
                    Ok(touched)
                })
            })
            .await
    }

    async fn statistics(&self, queue: &str) -> AppResult<JobStatistics> {
        let queue = queue.to_string();

        let row = self
            .db
            .run(move |conn| {
                let row = diesel::sql_query(
                    "SELECT
                         COUNT(*) FILTER (WHERE state = 'waiting' AND available_at <= NOW()) AS waiting_count,
                         COUNT(*) FILTER (WHERE state = 'waiting' AND available_at > NOW()) AS delayed_count,
                         COUNT(*) FILTER (WHERE state = 'active') AS active_count,
                         COUNT(*) FILTER (WHERE state = 'completed') AS completed_count,
                         COUNT(*) FILTER (WHERE state = 'failed') AS failed_count,
                         COUNT(*) AS total_count
                     FROM jobs
                     WHERE queue = $1",
                )
                .bind::<Text, _>(queue.as_str())
                .get_result::<CountsRow>(conn)?;
                Ok(row)
            })
            .await?;

        Ok(JobStatistics {
            waiting_count: row.waiting_count,
            delayed_count: row.delayed_count,
            active_count: row.active_count,
            completed_count: row.completed_count,
            failed_count: row.failed_count,
            total_count: row.total_count,
        })
    }

    async fn delete_finished_older_than(&self, max_age: Duration) -> AppResult<usize> {
        let max_age_ms = Self::millis(max_age);

        self.db
            .run(move |conn| {
                let deleted = diesel::sql_query(
                    "DELETE FROM jobs
                     WHERE state IN ('completed', 'failed')
                       AND finished_at < NOW() - ($1 * INTERVAL '1 millisecond')",
                )
                .bind::<BigInt, _>(max_age_ms)
                .execute(conn)?;
                Ok(deleted)
            })
            .await
    }

    async fn ping(&self) -> AppResult<()> {
        self.db
            .run(|conn| {
                diesel::sql_query("SELECT TRUE AS ok").get_result::<PingRow>(conn)?;
                Ok(())
            })
            .await
    }
}
