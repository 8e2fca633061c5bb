use std::sync::Arc;
use uuid::Uuid;

use crate::models::event::PushEvent;
use crate::models::job::{Job, JobState, JobType, Transition};
use crate::services::fanout::EventSink;
use crate::services::queue::{Broker, BrokerError, QueueMessage};
use crate::services::store::{JobStore, StoreError};
use crate::services::topology::Topology;

/// Outcome of a submission. `state` is `QUEUED`, or `FAILED` when the
/// record was created but the broker did not accept the message.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub job_id: Uuid,
    pub state: JobState,
}

/// Producer side of the pipeline: creates job records and publishes them.
pub struct Dispatcher {
    topology: Arc<Topology>,
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    sink: Arc<dyn EventSink>,
}

impl Dispatcher {
    pub fn new(
        topology: Arc<Topology>,
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            topology,
            store,
            broker,
            sink,
        }
    }

    /// Create a `QUEUED` job and publish it to its primary queue.
    pub async fn submit(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        owner_id: &str,
    ) -> Result<Submission, SubmitError> {
        let binding = self
            .topology
            .resolve(job_type)
            .ok_or_else(|| SubmitError::UnknownJobType(job_type.to_string()))?;

        if !self.broker.is_available() {
            return Err(SubmitError::TransportUnavailable);
        }

        let job = Job::new(binding.job_type, payload, owner_id);
        self.store.insert(&job).await?;
        metrics::counter!("jobs_submitted_total", "job_type" => job.job_type.to_string())
            .increment(1);

        // Announce before publishing so QUEUED always precedes PROCESSING.
        self.sink.emit(owner_id, PushEvent::for_job(&job)).await;

        let message = QueueMessage::new(job.id, job.job_type, job.payload.clone(), job.attempt);
        match self.broker.publish(&binding.queue, &message).await {
            Ok(()) => {
                tracing::info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    queue = %binding.queue,
                    owner_id = %owner_id,
                    "Job queued"
                );
                Ok(Submission {
                    job_id: job.id,
                    state: JobState::Queued,
                })
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, queue = %binding.queue, error = %e, "Publish failed");
                self.fail_unpublished(&job, &e).await
            }
        }
    }

    async fn fail_unpublished(&self, job: &Job, error: &BrokerError) -> Result<Submission, SubmitError> {
        let transition = Transition::PublishFailed {
            attempt: job.attempt,
            error: format!("transport error: {error}"),
        };
        let state = match self.store.transition(job.id, transition).await? {
            Some(failed) => {
                metrics::counter!("jobs_failed_total", "job_type" => job.job_type.to_string())
                    .increment(1);
                self.sink.emit(&job.owner_id, PushEvent::for_job(&failed)).await;
                failed.state
            }
            // Cancelled in the meantime.
            None => self
                .store
                .get(job.id)
                .await?
                .map_or(JobState::Failed, |current| current.state),
        };
        Ok(Submission {
            job_id: job.id,
            state,
        })
    }

    /// Cancel a job that has not reached a terminal state.
    ///
    /// A `QUEUED` job is skipped when its message is dequeued. A `PROCESSING`
    /// job is interrupted on the worker's next heartbeat where possible; any
    /// result it still produces is discarded.
    pub async fn cancel(&self, job_id: Uuid, reason: &str) -> Result<Job, SubmitError> {
        let transition = Transition::Cancel {
            reason: reason.to_string(),
        };
        match self.store.transition(job_id, transition).await? {
            Some(job) => {
                metrics::counter!("jobs_cancelled_total", "job_type" => job.job_type.to_string())
                    .increment(1);
                tracing::info!(job_id = %job_id, reason = %reason, "Job cancelled");
                self.sink.emit(&job.owner_id, PushEvent::for_job(&job)).await;
                Ok(job)
            }
            None => match self.store.get(job_id).await? {
                Some(job) => Err(SubmitError::NotCancellable {
                    job_id,
                    state: job.state,
                }),
                None => Err(SubmitError::NotFound(job_id)),
            },
        }
    }

    /// Resubmit a dead-lettered payload as a new job for the same owner.
    /// The original job stays terminal; its DLQ entry is removed once the
    /// new job is queued and restored otherwise.
    pub async fn replay_dead_letter(
        &self,
        job_type: JobType,
        job_id: Uuid,
    ) -> Result<Submission, SubmitError> {
        let binding = self
            .topology
            .binding(job_type)
            .ok_or_else(|| SubmitError::UnknownJobType(job_type.to_string()))?;

        let entry = self
            .broker
            .remove_dead_letter(&binding.dlq, job_id)
            .await?
            .ok_or(SubmitError::NotFound(job_id))?;

        match self
            .submit(entry.job_type.as_ref(), entry.payload.clone(), &entry.owner_id)
            .await
        {
            Ok(submission) if submission.state == JobState::Queued => {
                tracing::info!(
                    job_id = %job_id,
                    replayed_as = %submission.job_id,
                    "Dead letter replayed"
                );
                Ok(submission)
            }
            Ok(submission) => {
                tracing::warn!(
                    job_id = %job_id,
                    replayed_as = %submission.job_id,
                    state = %submission.state,
                    "Replay not queued, dead letter kept"
                );
                self.broker.dead_letter(&binding.dlq, &entry).await?;
                Ok(submission)
            }
            Err(e) => {
                // Keep the record for the next attempt.
                self.broker.dead_letter(&binding.dlq, &entry).await?;
                Err(e)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("message broker unavailable")]
    TransportUnavailable,

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {job_id} is {state} and cannot be cancelled")]
    NotCancellable { job_id: Uuid, state: JobState },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fanout::Fanout;
    use crate::services::memory_queue::MemoryBroker;
    use crate::services::queue::DeadLetter;
    use crate::services::store::MemoryJobStore;
    use chrono::Utc;

    struct Harness {
        dispatcher: Dispatcher,
        store: Arc<MemoryJobStore>,
        broker: Arc<MemoryBroker>,
        fanout: Arc<Fanout>,
    }

    fn harness() -> Harness {
        let topology = Arc::new(Topology::new(Topology::default_bindings()).unwrap());
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let fanout = Arc::new(Fanout::new());
        let dispatcher = Dispatcher::new(topology, store.clone(), broker.clone(), fanout.clone());
        Harness {
            dispatcher,
            store,
            broker,
            fanout,
        }
    }

    #[tokio::test]
    async fn test_submit_queues_and_publishes() {
        let h = harness();
        let mut sub = h.fanout.subscribe("u1");

        let submission = h
            .dispatcher
            .submit("size-inference", serde_json::json!({"product_id": "p1"}), "u1")
            .await
            .unwrap();

        assert_eq!(submission.state, JobState::Queued);
        let job = h.store.get(submission.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 0);
        assert_eq!(h.broker.depth("ai.size").await.unwrap(), 1);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.data.job_id, submission.job_id);
        assert_eq!(event.data.state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_unknown_type_creates_nothing() {
        let h = harness();
        let err = h
            .dispatcher
            .submit("unknown", serde_json::json!({}), "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::UnknownJobType(t) if t == "unknown"));
        assert_eq!(h.store.stats().await.unwrap().total, 0);
        for queue in ["ai.tryon", "ai.size", "ai.chat"] {
            assert_eq!(h.broker.depth(queue).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_disconnected_transport_fails_fast() {
        let h = harness();
        h.broker.set_available(false);
        let err = h
            .dispatcher
            .submit("chat-turn", serde_json::json!({"message": "hi"}), "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::TransportUnavailable));
        assert_eq!(h.store.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_publish_failure_marks_job_failed() {
        let h = harness();
        let mut sub = h.fanout.subscribe("u1");
        h.broker.fail_next_publishes(1);

        let submission = h
            .dispatcher
            .submit("image-generation", serde_json::json!({"image": "k"}), "u1")
            .await
            .unwrap();

        assert_eq!(submission.state, JobState::Failed);
        let job = h.store.get(submission.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.unwrap().starts_with("transport error"));
        assert_eq!(h.broker.depth("ai.tryon").await.unwrap(), 0);

        assert_eq!(sub.recv().await.unwrap().data.state, JobState::Queued);
        let failed = sub.recv().await.unwrap();
        assert_eq!(failed.data.state, JobState::Failed);
        assert_eq!(failed.event, crate::models::event::EventName::JobResult);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let h = harness();
        let submission = h
            .dispatcher
            .submit("chat-turn", serde_json::json!({"message": "hi"}), "u1")
            .await
            .unwrap();

        let cancelled = h.dispatcher.cancel(submission.job_id, "cancelled by user").await.unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);

        let err = h.dispatcher.cancel(submission.job_id, "again").await.unwrap_err();
        assert!(matches!(err, SubmitError::NotCancellable { state: JobState::Cancelled, .. }));

        let err = h.dispatcher.cancel(Uuid::new_v4(), "missing").await.unwrap_err();
        assert!(matches!(err, SubmitError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_replay_dead_letter_creates_new_job() {
        let h = harness();
        let dead_id = Uuid::new_v4();
        h.broker
            .dead_letter(
                "ai.tryon.dlq",
                &DeadLetter {
                    job_id: dead_id,
                    job_type: JobType::ImageGeneration,
                    owner_id: "u7".into(),
                    payload: serde_json::json!({"image": "k"}),
                    error: "timeout".into(),
                    attempt: 3,
                    dead_lettered_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let replayed = h
            .dispatcher
            .replay_dead_letter(JobType::ImageGeneration, dead_id)
            .await
            .unwrap();
        assert_ne!(replayed.job_id, dead_id);

        let job = h.store.get(replayed.job_id).await.unwrap().unwrap();
        assert_eq!(job.owner_id, "u7");
        assert_eq!(job.payload, serde_json::json!({"image": "k"}));
        assert!(h.broker.dead_letters("ai.tryon.dlq", 10).await.unwrap().is_empty());

        let err = h
            .dispatcher
            .replay_dead_letter(JobType::ImageGeneration, dead_id)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_replay_keeps_dead_letter_when_publish_fails() {
        let h = harness();
        let dead_id = Uuid::new_v4();
        h.broker
            .dead_letter(
                "ai.size.dlq",
                &DeadLetter {
                    job_id: dead_id,
                    job_type: JobType::SizeInference,
                    owner_id: "u7".into(),
                    payload: serde_json::json!({"height_cm": 180}),
                    error: "upstream 503".into(),
                    attempt: 3,
                    dead_lettered_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        h.broker.fail_next_publishes(1);

        let replayed = h
            .dispatcher
            .replay_dead_letter(JobType::SizeInference, dead_id)
            .await
            .unwrap();
        assert_eq!(replayed.state, JobState::Failed);

        let kept = h.broker.dead_letters("ai.size.dlq", 10).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].job_id, dead_id);

        // The next replay goes through.
        let retried = h
            .dispatcher
            .replay_dead_letter(JobType::SizeInference, dead_id)
            .await
            .unwrap();
        assert_eq!(retried.state, JobState::Queued);
        assert!(h.broker.dead_letters("ai.size.dlq", 10).await.unwrap().is_empty());
    }
}
