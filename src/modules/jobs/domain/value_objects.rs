/// Database mirror of `JobState`
use super::entities::JobState;
use serde::{Deserialize, Serialize};

#[derive(
    diesel_derive_enum::DbEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[ExistingTypePath = "crate::schema::sql_types::JobState"]
#[serde(rename_all = "lowercase")]
pub enum JobStateDb {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl From<JobStateDb> for JobState {
    fn from(value: JobStateDb) -> Self {
        match value {
            JobStateDb::Waiting => JobState::Waiting,
            JobStateDb::Active => JobState::Active,
            JobStateDb::Completed => JobState::Completed,
            JobStateDb::Failed => JobState::Failed,
        }
    }
}

impl From<JobState> for JobStateDb {
    fn from(value: JobState) -> Self {
        match value {
            JobState::Waiting => JobStateDb::Waiting,
            JobState::Active => JobStateDb::Active,
            JobState::Completed => JobStateDb::Completed,
            JobState::Failed => JobStateDb::Failed,
        }
    }
}
