/// Domain entities for the job queue
///
/// A job moves `waiting -> active -> {completed | waiting (retry) | failed}`.
/// Delayed jobs are waiting jobs whose `available_at` is still in the future.
use super::backoff::BackoffPolicy;
use crate::shared::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Job state enum matching the database type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn is_outstanding(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Active)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::Active => write!(f, "active"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}

/// Job type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Run every enrichment stage that is missing or forced
    EnrichEntity,
    /// Regenerate rich insights only
    RefreshInsights,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::EnrichEntity => write!(f, "enrich_entity"),
            JobType::RefreshInsights => write!(f, "refresh_insights"),
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "enrich_entity" => Ok(JobType::EnrichEntity),
            "refresh_insights" => Ok(JobType::RefreshInsights),
            _ => Err(format!("Invalid job type: {}", s)),
        }
    }
}

/// Payload for `EnrichEntity` jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichEntityPayload {
    pub entity_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Payload for `RefreshInsights` jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshInsightsPayload {
    pub entity_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Options accepted by `enqueue`
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOptions {
    /// Higher runs first
    pub priority: i32,
    pub delay: Duration,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// At most one waiting or active job per key and queue
    pub dedupe_key: Option<String>,
    /// On a dedupe hit, this payload replaces a waiting job's payload, or
    /// runs as a follow-up once the active job settles
    pub supersede: bool,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: Duration::ZERO,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            dedupe_key: None,
            supersede: false,
        }
    }
}

/// New job to be queued (before it is stored)
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub queue: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub options: EnqueueOptions,
}

impl NewJob {
    pub fn new<P: Serialize>(
        queue: &str,
        job_type: JobType,
        payload: &P,
        options: EnqueueOptions,
    ) -> AppResult<Self> {
        if options.max_attempts == 0 {
            return Err(AppError::InvalidInput(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            queue: queue.to_string(),
            job_type,
            payload: serde_json::to_value(payload)?,
            options,
        })
    }

    pub fn enrich_entity(
        queue: &str,
        payload: &EnrichEntityPayload,
        options: EnqueueOptions,
    ) -> AppResult<Self> {
        Self::new(queue, JobType::EnrichEntity, payload, options)
    }

    pub fn refresh_insights(
        queue: &str,
        payload: &RefreshInsightsPayload,
        options: EnqueueOptions,
    ) -> AppResult<Self> {
        Self::new(queue, JobType::RefreshInsights, payload, options)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressCounts {
    pub done: u32,
    pub total: u32,
}

/// Informational progress; never affects state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub stage: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counts: Option<ProgressCounts>,
}

impl JobProgress {
    pub fn new(stage: &str, message: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            message: message.into(),
            counts: None,
        }
    }

    pub fn with_counts(mut self, done: u32, total: u32) -> Self {
        self.counts = Some(ProgressCounts { done, total });
        self
    }
}

/// Stored job with its metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub queue: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub dedupe_key: Option<String>,
    pub progress: Option<JobProgress>,
    pub result: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
    pub lock_token: Option<Uuid>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    /// Insertion order, for FIFO among equal priorities
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Payload queued behind this active job by a superseding enqueue
    pub follow_up: Option<serde_json::Value>,
}

impl JobRecord {
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.available_at > now
    }

    /// Waiting and past its delay
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.available_at <= now
    }

    pub fn lock_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.lock_expires_at.map_or(true, |at| at <= now)
    }

    pub fn holds_lock(&self, token: Uuid, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.lock_token == Some(token) && !self.lock_expired(now)
    }

    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// The job that replays `follow_up` once this one settles
    pub fn follow_up_job(&self) -> Option<NewJob> {
        let payload = self.follow_up.clone()?;
        Some(NewJob {
            queue: self.queue.clone(),
            job_type: self.job_type,
            payload,
            options: EnqueueOptions {
                priority: self.priority,
                delay: Duration::ZERO,
                max_attempts: self.max_attempts,
                backoff: self.backoff,
                dedupe_key: self.dedupe_key.clone(),
                supersede: false,
            },
        })
    }

    pub fn parse_payload<T: DeserializeOwned>(&self) -> AppResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            AppError::InvalidInput(format!(
                "Invalid {} payload for job {}: {}",
                self.job_type, self.id, e
            ))
        })
    }

    pub fn status(&self) -> JobStatusSnapshot {
        JobStatusSnapshot {
            id: self.id,
            state: self.state,
            progress: self.progress.clone(),
            result: self.result.clone(),
            failed_reason: self.failed_reason.clone(),
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts,
        }
    }
}

/// What status polling returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusSnapshot {
    pub id: Uuid,
    pub state: JobState,
    pub progress: Option<JobProgress>,
    pub result: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
    pub attempts_made: u32,
    pub max_attempts: u32,
}

/// How many finished jobs a queue keeps
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    pub keep_completed: usize,
    pub keep_failed: usize,
    pub max_age: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_completed: 1_000,
            keep_failed: 5_000,
            max_age: Some(Duration::from_secs(7 * 24 * 60 * 60)),
        }
    }
}

impl RetentionPolicy {
    pub fn with_max_age_days(days: u32) -> Self {
        Self {
            max_age: Some(Duration::from_secs(days as u64 * 24 * 60 * 60)),
            ..Self::default()
        }
    }
}
