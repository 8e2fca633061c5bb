//! Background maintenance shared by every worker process: stalled-job
//! recovery, republishing of queued jobs whose message was lost,
//! delayed-retry promotion with queue depth reporting, and redelivery of
//! stranded messages after a broker reconnect.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::models::event::PushEvent;
use crate::models::job::{Job, Transition};
use crate::services::consumer::ConsumerError;
use crate::services::fanout::EventSink;
use crate::services::queue::{Broker, DeadLetter, QueueMessage};
use crate::services::store::JobStore;
use crate::services::topology::Topology;

const SWEEP_BATCH: u32 = 100;

/// Finds `PROCESSING` jobs whose worker stopped heartbeating and puts them
/// back on their queue, or dead-letters them once attempts are exhausted.
///
/// It also republishes `QUEUED` jobs left idle for longer than any delayed
/// retry could take. Those were written as queued by a process that died
/// before publishing. A duplicate message is dropped by the claim guard.
pub struct StallReaper {
    topology: Arc<Topology>,
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    sink: Arc<dyn EventSink>,
    stall_timeout: Duration,
    max_backoff: Duration,
}

impl StallReaper {
    pub fn new(
        topology: Arc<Topology>,
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        sink: Arc<dyn EventSink>,
        stall_timeout: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            topology,
            store,
            broker,
            sink,
            stall_timeout,
            max_backoff,
        }
    }

    /// One pass over stalled and orphaned jobs. Returns how many were acted on.
    pub async fn sweep(&self) -> Result<usize, ConsumerError> {
        let now = Utc::now();
        let stall = chrono::Duration::from_std(self.stall_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let grace = chrono::Duration::from_std(self.max_backoff).unwrap_or_else(|_| stall);
        let stalled = self.store.stalled(now - stall, SWEEP_BATCH).await?;
        let orphaned = self.store.orphaned(now - stall - grace, SWEEP_BATCH).await?;

        let mut recovered = 0;
        for job in stalled {
            if self.recover(&job).await? {
                recovered += 1;
            }
        }
        for job in orphaned {
            if self.republish(&job).await? {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn republish(&self, job: &Job) -> Result<bool, ConsumerError> {
        let Some(binding) = self.topology.binding(job.job_type) else {
            warn!(job_id = %job.id, job_type = %job.job_type, "Queued job has no binding");
            return Ok(false);
        };

        // Only one reaper wins the touch, and a claim in between makes it miss.
        let Some(queued) = self
            .store
            .transition(job.id, Transition::Republish { attempt: job.attempt })
            .await?
        else {
            return Ok(false);
        };

        let message = QueueMessage::new(queued.id, queued.job_type, queued.payload.clone(), queued.attempt);
        if let Err(e) = self.broker.publish(&binding.queue, &message).await {
            warn!(job_id = %queued.id, error = %e, "Republish of queued job failed, next sweep retries");
            return Ok(false);
        }

        metrics::counter!("jobs_republished_total", "job_type" => queued.job_type.to_string())
            .increment(1);
        warn!(job_id = %queued.id, attempt = queued.attempt, queue = %binding.queue, "Queued job republished");
        Ok(true)
    }

    async fn recover(&self, job: &Job) -> Result<bool, ConsumerError> {
        let Some(binding) = self.topology.binding(job.job_type) else {
            warn!(job_id = %job.id, job_type = %job.job_type, "Stalled job has no binding");
            return Ok(false);
        };

        if job.attempt >= binding.max_attempts {
            let transition = Transition::DeadLetter {
                attempt: job.attempt,
                error: format!("execution stalled after {} attempts", job.attempt),
            };
            let Some(dead) = self.store.transition(job.id, transition).await? else {
                return Ok(false);
            };
            metrics::counter!("jobs_dead_lettered_total", "job_type" => dead.job_type.to_string())
                .increment(1);
            let entry = DeadLetter {
                job_id: dead.id,
                job_type: dead.job_type,
                owner_id: dead.owner_id.clone(),
                payload: dead.payload.clone(),
                error: dead.error.clone().unwrap_or_default(),
                attempt: dead.attempt,
                dead_lettered_at: Utc::now(),
            };
            if let Err(e) = self.broker.dead_letter(&binding.dlq, &entry).await {
                error!(job_id = %dead.id, dlq = %binding.dlq, error = %e, "DLQ write failed");
            }
            warn!(job_id = %dead.id, attempt = dead.attempt, "Stalled job dead-lettered");
            self.sink.emit(&dead.owner_id, PushEvent::for_job(&dead)).await;
            return Ok(true);
        }

        let Some(queued) = self
            .store
            .transition(job.id, Transition::Recover { attempt: job.attempt })
            .await?
        else {
            return Ok(false);
        };

        let message = QueueMessage::new(queued.id, queued.job_type, queued.payload.clone(), queued.attempt);
        if let Err(e) = self.broker.publish(&binding.queue, &message).await {
            error!(job_id = %queued.id, error = %e, "Republish of stalled job failed");
            let transition = Transition::PublishFailed {
                attempt: queued.attempt,
                error: format!("transport error: {e}"),
            };
            if let Some(failed) = self.store.transition(queued.id, transition).await? {
                metrics::counter!("jobs_failed_total", "job_type" => failed.job_type.to_string())
                    .increment(1);
                self.sink.emit(&failed.owner_id, PushEvent::for_job(&failed)).await;
            }
            return Ok(true);
        }

        metrics::counter!("jobs_retried_total", "job_type" => queued.job_type.to_string())
            .increment(1);
        info!(job_id = %queued.id, attempt = queued.attempt, "Stalled job requeued");
        self.sink.emit(&queued.owner_id, PushEvent::retrying(&queued)).await;
        Ok(true)
    }

    /// Sweep every `interval` until shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => match self.sweep().await {
                    Ok(0) => {}
                    Ok(n) => info!(recovered = n, "Stall sweep complete"),
                    Err(e) => warn!(error = %e, "Stall sweep failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Stall reaper stopped");
    }
}

/// Moves due delayed retries onto their queues and reports queue depth.
pub async fn run_promoter(
    topology: Arc<Topology>,
    broker: Arc<dyn Broker>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for binding in topology.bindings() {
                    match broker.promote_due(&binding.queue).await {
                        Ok(0) => {}
                        Ok(n) => debug!(queue = %binding.queue, promoted = n, "Delayed retries promoted"),
                        Err(e) => warn!(queue = %binding.queue, error = %e, "Promotion failed"),
                    }
                    if let Ok(depth) = broker.depth(&binding.queue).await {
                        metrics::gauge!("queue_depth", "queue" => binding.queue.clone())
                            .set(depth as f64);
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Delayed retry promoter stopped");
}

/// Return `consumer_id`'s unacknowledged deliveries to their queues after
/// every transport reconnect. Acks and requeues that failed during the
/// outage are otherwise stuck in processing lists until the next restart.
pub async fn run_reconnect_recovery(
    topology: Arc<Topology>,
    broker: Arc<dyn Broker>,
    consumer_id: String,
    mut reconnects: broadcast::Receiver<u64>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = reconnects.recv() => {
                if let Err(broadcast::error::RecvError::Closed) = event {
                    break;
                }
                for binding in topology.bindings() {
                    match broker.recover(&binding.queue, &consumer_id).await {
                        Ok(0) => {}
                        Ok(n) => info!(queue = %binding.queue, recovered = n, "Redelivering after reconnect"),
                        Err(e) => warn!(queue = %binding.queue, error = %e, "Recovery after reconnect failed"),
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Reconnect recovery stopped");
}
