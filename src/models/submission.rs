use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{Job, JobSnapshot, JobState};

/// Request body for `POST /api/v1/jobs`.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitRequest {
    /// Checked against the queue topology by the dispatcher.
    #[garde(length(min = 1, max = 64))]
    pub job_type: String,

    #[garde(skip)]
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Response after submitting a job.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub state: JobState,
    pub message: String,
}

/// Response for polling a job.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub job_type: String,
    pub state: JobState,
    pub attempt: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub terminal: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<JobSnapshot> for JobStatusResponse {
    fn from(snapshot: JobSnapshot) -> Self {
        let Job {
            id,
            job_type,
            state,
            attempt,
            result,
            error,
            created_at,
            updated_at,
            ..
        } = snapshot.job;
        Self {
            job_id: id,
            job_type: job_type.to_string(),
            state,
            attempt,
            result,
            error,
            terminal: snapshot.terminal,
            created_at,
            updated_at,
        }
    }
}

/// Query string for the admin job listing.
#[derive(Debug, Deserialize, Validate)]
pub struct ListJobsQuery {
    #[garde(range(min = 1))]
    #[serde(default = "default_page")]
    pub page: u32,

    #[garde(range(min = 1, max = 100))]
    #[serde(default = "default_limit")]
    pub limit: u32,

    #[garde(skip)]
    pub state: Option<JobState>,

    #[garde(skip)]
    pub job_type: Option<String>,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}
