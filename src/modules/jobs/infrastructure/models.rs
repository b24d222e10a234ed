/// Diesel model for the jobs table
use crate::modules::jobs::domain::entities::{JobRecord, JobType};
use crate::modules::jobs::domain::value_objects::JobStateDb;
use crate::schema::jobs;
use crate::shared::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Columns in the order `JobModel` expects them from raw queries
pub const JOB_COLUMNS: &str = "id, queue, job_type, payload, priority, state, attempts_made, \
     max_attempts, backoff, dedupe_key, progress, result, failed_reason, lock_token, \
     lock_expires_at, available_at, enqueue_seq, created_at, started_at, finished_at, follow_up";

#[derive(Queryable, Selectable, QueryableByName, Debug, Clone)]
#[diesel(table_name = jobs)]
pub struct JobModel {
    pub id: Uuid,
    pub queue: String,
    pub job_type: String,
    pub payload: JsonValue,
    pub priority: i32,
    pub state: JobStateDb,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub backoff: JsonValue,
    pub dedupe_key: Option<String>,
    pub progress: Option<JsonValue>,
    pub result: Option<JsonValue>,
    pub failed_reason: Option<String>,
    pub lock_token: Option<Uuid>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub enqueue_seq: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub follow_up: Option<JsonValue>,
}

impl JobModel {
    /// Convert to domain JobRecord
    pub fn into_record(self) -> AppResult<JobRecord> {
        let job_type = self
            .job_type
            .parse::<JobType>()
            .map_err(AppError::InternalError)?;

        Ok(JobRecord {
            id: self.id,
            queue: self.queue,
            job_type,
            payload: self.payload,
            priority: self.priority,
            state: self.state.into(),
            attempts_made: self.attempts_made.max(0) as u32,
            max_attempts: self.max_attempts.max(1) as u32,
            backoff: serde_json::from_value(self.backoff)?,
            dedupe_key: self.dedupe_key,
            progress: self.progress.map(serde_json::from_value).transpose()?,
            result: self.result,
            failed_reason: self.failed_reason,
            lock_token: self.lock_token,
            lock_expires_at: self.lock_expires_at,
            available_at: self.available_at,
            sequence: self.enqueue_seq,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            follow_up: self.follow_up,
        })
    }
}
