use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Kind of offloaded work. Determines the queue binding and the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum JobType {
    /// Virtual try-on image generation.
    ImageGeneration,
    /// Garment size recommendation.
    SizeInference,
    /// One assistant turn of a support chat.
    ChatTurn,
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    DeadLettered,
    Cancelled,
}

impl JobState {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::DeadLettered | JobState::Cancelled
        )
    }
}

/// One unit of offloaded work, as recorded in the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempt: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A freshly submitted job: `QUEUED`, no attempts yet.
    pub fn new(job_type: JobType, payload: serde_json::Value, owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type,
            payload,
            state: JobState::Queued,
            attempt: 0,
            result: None,
            error: None,
            owner_id: owner_id.into(),
            created_at: now,
            updated_at: now,
            heartbeat_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a conditional transition.
    ///
    /// Returns the updated job, or `None` when the job is not in the state
    /// (or attempt) the transition expects. Stores use this as the single
    /// definition of what each transition means.
    pub fn apply(&self, transition: &Transition, now: DateTime<Utc>) -> Option<Job> {
        if !transition.expected_states().contains(&self.state) {
            return None;
        }
        if let Some(expected) = transition.expected_attempt() {
            if self.attempt != expected {
                return None;
            }
        }

        let mut next = self.clone();
        next.state = transition.target_state();
        next.updated_at = now;
        next.heartbeat_at = None;

        match transition {
            Transition::Claim { .. } => {
                next.attempt += 1;
                next.heartbeat_at = Some(now);
            }
            Transition::Complete { result, .. } => {
                next.result = Some(result.clone());
                next.error = None;
            }
            Transition::Retry { .. } | Transition::Recover { .. } | Transition::Republish { .. } => {}
            Transition::Fail { error, .. }
            | Transition::DeadLetter { error, .. }
            | Transition::PublishFailed { error, .. }
            | Transition::Cancel { reason: error } => {
                next.result = None;
                next.error = Some(error.clone());
            }
        }

        Some(next)
    }
}

/// A state change requested of the job store.
///
/// Every variant is a compare-and-set: it only applies when the job is in
/// one of [`Transition::expected_states`] and, when given, at the expected
/// attempt count.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// `QUEUED(attempt) -> PROCESSING(attempt + 1)`.
    Claim { expected_attempt: u32 },
    /// `PROCESSING -> COMPLETED`.
    Complete { attempt: u32, result: serde_json::Value },
    /// `PROCESSING -> QUEUED` after a transient failure.
    Retry { attempt: u32 },
    /// `PROCESSING -> QUEUED` for a stalled execution.
    Recover { attempt: u32 },
    /// `PROCESSING -> FAILED` on a permanent failure.
    Fail { attempt: u32, error: String },
    /// `PROCESSING -> DEAD_LETTERED` once attempts are exhausted.
    DeadLetter { attempt: u32, error: String },
    /// `QUEUED -> QUEUED` at the same attempt, before publishing a
    /// replacement for a message that never reached the broker.
    Republish { attempt: u32 },
    /// `QUEUED -> FAILED` when the broker did not accept the job's message.
    PublishFailed { attempt: u32, error: String },
    /// `QUEUED | PROCESSING -> CANCELLED`.
    Cancel { reason: String },
}

impl Transition {
    pub fn expected_states(&self) -> &'static [JobState] {
        match self {
            Transition::Claim { .. } | Transition::Republish { .. } | Transition::PublishFailed { .. } => {
                &[JobState::Queued]
            }
            Transition::Cancel { .. } => &[JobState::Queued, JobState::Processing],
            _ => &[JobState::Processing],
        }
    }

    pub fn expected_attempt(&self) -> Option<u32> {
        match self {
            Transition::Claim { expected_attempt } => Some(*expected_attempt),
            Transition::Complete { attempt, .. }
            | Transition::Retry { attempt }
            | Transition::Recover { attempt }
            | Transition::Republish { attempt }
            | Transition::Fail { attempt, .. }
            | Transition::DeadLetter { attempt, .. }
            | Transition::PublishFailed { attempt, .. } => Some(*attempt),
            Transition::Cancel { .. } => None,
        }
    }

    pub fn target_state(&self) -> JobState {
        match self {
            Transition::Claim { .. } => JobState::Processing,
            Transition::Complete { .. } => JobState::Completed,
            Transition::Retry { .. } | Transition::Recover { .. } | Transition::Republish { .. } => {
                JobState::Queued
            }
            Transition::Fail { .. } | Transition::PublishFailed { .. } => JobState::Failed,
            Transition::DeadLetter { .. } => JobState::DeadLettered,
            Transition::Cancel { .. } => JobState::Cancelled,
        }
    }
}

/// Point-in-time view of a job returned to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    #[serde(flatten)]
    pub job: Job,
    /// Pollers stop once this is true.
    pub terminal: bool,
}

impl From<Job> for JobSnapshot {
    fn from(job: Job) -> Self {
        let terminal = job.is_terminal();
        Self { job, terminal }
    }
}

/// Admin listing filter.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub job_type: Option<JobType>,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub items: Vec<Job>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

/// Job counts by state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    pub total: u64,
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub cancelled: u64,
}

impl JobStats {
    pub fn record(&mut self, state: JobState, count: u64) {
        self.total += count;
        match state {
            JobState::Queued => self.queued += count,
            JobState::Processing => self.processing += count,
            JobState::Completed => self.completed += count,
            JobState::Failed => self.failed += count,
            JobState::DeadLettered => self.dead_lettered += count,
            JobState::Cancelled => self.cancelled += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processing_job() -> Job {
        let job = Job::new(JobType::ImageGeneration, serde_json::json!({"a": 1}), "u1");
        job.apply(&Transition::Claim { expected_attempt: 0 }, Utc::now())
            .unwrap()
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(JobType::ImageGeneration.to_string(), "image-generation");
        assert_eq!("chat-turn".parse::<JobType>().unwrap(), JobType::ChatTurn);
        assert_eq!(JobState::DeadLettered.as_ref(), "DEAD_LETTERED");
        assert_eq!(
            serde_json::to_value(JobState::DeadLettered).unwrap(),
            serde_json::json!("DEAD_LETTERED")
        );
        assert!("unknown".parse::<JobType>().is_err());
    }

    #[test]
    fn test_claim_increments_attempt() {
        let job = processing_job();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.attempt, 1);
        assert!(job.heartbeat_at.is_some());
    }

    #[test]
    fn test_stale_claim_is_rejected() {
        let job = processing_job();
        let retried = job.apply(&Transition::Retry { attempt: 1 }, Utc::now()).unwrap();
        assert_eq!(retried.state, JobState::Queued);
        // A redelivered copy of the first message still carries attempt 0.
        assert!(retried
            .apply(&Transition::Claim { expected_attempt: 0 }, Utc::now())
            .is_none());
        assert!(retried
            .apply(&Transition::Claim { expected_attempt: 1 }, Utc::now())
            .is_some());
    }

    #[test]
    fn test_complete_twice_keeps_first_result() {
        let job = processing_job();
        let done = job
            .apply(
                &Transition::Complete { attempt: 1, result: serde_json::json!("first") },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(done.result, Some(serde_json::json!("first")));
        assert!(done
            .apply(
                &Transition::Complete { attempt: 1, result: serde_json::json!("second") },
                Utc::now(),
            )
            .is_none());
    }

    #[test]
    fn test_result_and_error_are_exclusive() {
        let job = processing_job();
        let failed = job
            .apply(&Transition::Fail { attempt: 1, error: "bad".into() }, Utc::now())
            .unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert!(failed.result.is_none());
        assert_eq!(failed.error.as_deref(), Some("bad"));
    }

    #[test]
    fn test_republish_touches_queued_job_at_same_attempt() {
        let job = processing_job();
        let queued = job.apply(&Transition::Retry { attempt: 1 }, Utc::now()).unwrap();
        let later = Utc::now() + chrono::Duration::seconds(5);

        let touched = queued.apply(&Transition::Republish { attempt: 1 }, later).unwrap();
        assert_eq!(touched.state, JobState::Queued);
        assert_eq!(touched.attempt, 1);
        assert_eq!(touched.updated_at, later);

        assert!(queued.apply(&Transition::Republish { attempt: 0 }, later).is_none());
        assert!(job.apply(&Transition::Republish { attempt: 1 }, later).is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::DeadLettered.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn test_cancel_applies_to_queued_and_processing_only() {
        let queued = Job::new(JobType::SizeInference, serde_json::Value::Null, "u1");
        let cancel = Transition::Cancel { reason: "cancelled by user".into() };
        assert_eq!(queued.apply(&cancel, Utc::now()).unwrap().state, JobState::Cancelled);
        assert!(processing_job().apply(&cancel, Utc::now()).is_some());

        let done = processing_job()
            .apply(&Transition::Complete { attempt: 1, result: serde_json::json!({}) }, Utc::now())
            .unwrap();
        assert!(done.apply(&cancel, Utc::now()).is_none());
    }
}
