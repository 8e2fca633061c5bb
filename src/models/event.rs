use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use uuid::Uuid;

use crate::models::job::{Job, JobState};

/// Name of a server-to-client push event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
pub enum EventName {
    /// Non-terminal transitions, including retry re-queues and progress.
    #[serde(rename = "job:status")]
    #[strum(serialize = "job:status")]
    JobStatus,
    /// Terminal transitions: success, failure, dead-letter, cancellation.
    #[serde(rename = "job:result")]
    #[strum(serialize = "job:result")]
    JobResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEventData {
    pub job_id: Uuid,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrying: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A push frame: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub event: EventName,
    pub data: JobEventData,
}

impl PushEvent {
    /// Event describing the job's current state.
    pub fn for_job(job: &Job) -> Self {
        let event = if job.is_terminal() {
            EventName::JobResult
        } else {
            EventName::JobStatus
        };
        Self {
            event,
            data: JobEventData {
                job_id: job.id,
                state: job.state,
                progress: None,
                retrying: None,
                result: job.result.clone(),
                error: job.error.clone(),
            },
        }
    }

    /// `job:status {QUEUED, retrying: true}`.
    pub fn retrying(job: &Job) -> Self {
        let mut event = Self::for_job(job);
        event.data.retrying = Some(true);
        event
    }

    /// `job:status {PROCESSING, progress}`.
    pub fn progress(job_id: Uuid, progress: u8) -> Self {
        Self {
            event: EventName::JobStatus,
            data: JobEventData {
                job_id,
                state: JobState::Processing,
                progress: Some(progress.min(100)),
                retrying: None,
                result: None,
                error: None,
            },
        }
    }
}

/// Event addressed to an owner, as carried between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedEvent {
    pub owner_id: String,
    pub event: PushEvent,
}
