//! Queue consumer: claims deliveries, runs executors, applies the retry
//! policy and acknowledges.
//!
//! A delivery is acknowledged only after the job store reflects its outcome.
//! A consumer that dies in between leaves the message in its processing
//! list; [`Broker::recover`] hands it back on the next start, and the
//! attempt-guarded claim makes the redelivery harmless.

use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::models::event::PushEvent;
use crate::models::job::{Job, JobState, Transition};
use crate::services::executor::{ExecutionContext, ExecutionError, JobExecutor};
use crate::services::fanout::EventSink;
use crate::services::queue::{Broker, BrokerError, DeadLetter, Delivery, QueueMessage};
use crate::services::retry::{RetryDecision, RetryPolicy};
use crate::services::store::{JobStore, StoreError};
use crate::services::topology::QueueBinding;

const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// `poll_interval * 2^errors`, capped at [`MAX_ERROR_BACKOFF`].
fn error_backoff(poll_interval: Duration, consecutive_errors: u32) -> Duration {
    poll_interval
        .saturating_mul(2u32.saturating_pow(consecutive_errors.min(6)))
        .min(MAX_ERROR_BACKOFF)
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Stable per process; names the broker's processing list.
    pub consumer_id: String,
    /// Deliveries executed concurrently.
    pub prefetch: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub execution_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_id: "worker-1".to_string(),
            prefetch: 1,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// How an execution ended, from the consumer's point of view.
enum Outcome {
    Finished(Result<serde_json::Value, ExecutionError>),
    /// The job left `PROCESSING` under us (cancelled or recovered).
    Abandoned,
}

/// Consumes one queue binding.
pub struct Consumer {
    binding: QueueBinding,
    broker: Arc<dyn Broker>,
    store: Arc<dyn JobStore>,
    sink: Arc<dyn EventSink>,
    executor: Arc<dyn JobExecutor>,
    policy: RetryPolicy,
    config: ConsumerConfig,
    permits: Arc<Semaphore>,
    /// Deliveries in a row that ended requeued. Reset by any delivery
    /// that reaches the store.
    failed_deliveries: AtomicU32,
}

impl Consumer {
    pub fn new(
        binding: QueueBinding,
        broker: Arc<dyn Broker>,
        store: Arc<dyn JobStore>,
        sink: Arc<dyn EventSink>,
        executor: Arc<dyn JobExecutor>,
        policy: RetryPolicy,
        config: ConsumerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.prefetch.max(1)));
        Self {
            binding,
            broker,
            store,
            sink,
            executor,
            policy,
            config,
            permits,
            failed_deliveries: AtomicU32::new(0),
        }
    }

    pub fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    /// Run until `shutdown` flips to `true`, then drain in-flight deliveries.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let queue = self.binding.queue.clone();
        info!(
            queue = %queue,
            consumer_id = %self.config.consumer_id,
            prefetch = self.config.prefetch,
            "Starting consumer"
        );

        match self.broker.recover(&queue, &self.config.consumer_id).await {
            Ok(0) => {}
            Ok(n) => info!(queue = %queue, recovered = n, "Recovered unacknowledged deliveries"),
            Err(e) => warn!(queue = %queue, error = %e, "Failed to recover unacknowledged deliveries"),
        }

        let mut tasks = JoinSet::new();
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(queue = %queue, error = %e, "Delivery task panicked");
                }
            }

            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            // Back off while deliveries keep ending up requeued.
            let failed = self.failed_deliveries.load(Ordering::Acquire);
            if failed > 0 {
                let backoff = error_backoff(self.config.poll_interval, failed);
                debug!(
                    queue = %queue,
                    failed_deliveries = failed,
                    backoff_ms = backoff.as_millis() as u64,
                    "Deliveries failing, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            let idle = match self.broker.receive(&self.binding, &self.config.consumer_id).await {
                Ok(Some(delivery)) => {
                    if consecutive_errors > 0 {
                        info!(queue = %queue, consecutive_errors, "Broker recovered");
                        consecutive_errors = 0;
                    }
                    let this = Arc::clone(&self);
                    tasks.spawn(async move {
                        let _permit = permit;
                        this.handle(delivery).await;
                    });
                    continue;
                }
                Ok(None) => self.config.poll_interval,
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = error_backoff(self.config.poll_interval, consecutive_errors);
                    warn!(
                        queue = %queue,
                        error = %e,
                        consecutive_errors,
                        backoff_ms = backoff.as_millis() as u64,
                        "Receive failed, backing off"
                    );
                    backoff
                }
            };
            drop(permit);

            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(queue = %queue, in_flight = tasks.len(), "Consumer stopping, draining deliveries");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(queue = %queue, error = %e, "Delivery task panicked");
            }
        }
        info!(queue = %queue, "Consumer stopped");
    }

    /// Process one delivery to acknowledgement. Store or broker failures put
    /// the message back on the queue and slow the receive loop down.
    pub async fn handle(&self, delivery: Delivery) {
        let job_id = delivery.message.job_id;
        if let Err(e) = self.process(&delivery).await {
            let failed = self.failed_deliveries.fetch_add(1, Ordering::AcqRel) + 1;
            error!(
                job_id = %job_id,
                queue = %delivery.queue,
                error = %e,
                failed_deliveries = failed,
                "Delivery failed, requeueing"
            );
            if let Err(e) = self.broker.requeue(&delivery).await {
                error!(
                    job_id = %job_id,
                    error = %e,
                    "Requeue failed, message left for recovery"
                );
            }
        } else if self.failed_deliveries.swap(0, Ordering::AcqRel) > 0 {
            info!(queue = %delivery.queue, "Deliveries succeeding again");
        }
    }

    async fn process(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        let message = &delivery.message;
        let claim = Transition::Claim {
            expected_attempt: message.attempt,
        };

        let Some(job) = self.store.transition(message.job_id, claim).await? else {
            debug!(
                job_id = %message.job_id,
                attempt = message.attempt,
                "Skipping stale or duplicate delivery"
            );
            self.broker.ack(delivery).await?;
            return Ok(());
        };

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt,
            "Processing job"
        );
        self.sink.emit(&job.owner_id, PushEvent::for_job(&job)).await;

        let started = Instant::now();
        let outcome = self.execute(&job).await;
        metrics::histogram!("job_execution_seconds", "job_type" => job.job_type.to_string())
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Outcome::Finished(Ok(result)) => self.complete(delivery, &job, result).await,
            Outcome::Finished(Err(error)) => self.fail(delivery, &job, error).await,
            Outcome::Abandoned => {
                info!(job_id = %job.id, attempt = job.attempt, "Execution abandoned, job no longer processing");
                self.broker.ack(delivery).await?;
                Ok(())
            }
        }
    }

    /// Run the executor as its own task, heartbeating while it runs.
    async fn execute(&self, job: &Job) -> Outcome {
        let ctx = ExecutionContext::new(
            job.id,
            job.job_type,
            job.owner_id.clone(),
            job.attempt,
            job.payload.clone(),
            self.sink.clone(),
        );
        let executor = self.executor.clone();
        let mut handle = tokio::spawn(async move { executor.execute(ctx).await });

        let deadline = tokio::time::sleep(self.config.execution_timeout);
        tokio::pin!(deadline);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                joined = &mut handle => {
                    return Outcome::Finished(match joined {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => {
                            Err(ExecutionError::Transient("executor panicked".to_string()))
                        }
                        Err(e) => Err(ExecutionError::Transient(format!("executor task failed: {e}"))),
                    });
                }
                _ = &mut deadline => {
                    handle.abort();
                    return Outcome::Finished(Err(ExecutionError::Transient(format!(
                        "execution timed out after {}ms",
                        self.config.execution_timeout.as_millis()
                    ))));
                }
                _ = heartbeat.tick() => match self.store.heartbeat(job.id, job.attempt).await {
                    Ok(true) => {}
                    Ok(false) => {
                        handle.abort();
                        return Outcome::Abandoned;
                    }
                    Err(e) => warn!(job_id = %job.id, error = %e, "Heartbeat failed"),
                },
            }
        }
    }

    async fn complete(
        &self,
        delivery: &Delivery,
        job: &Job,
        result: serde_json::Value,
    ) -> Result<(), ConsumerError> {
        let transition = Transition::Complete {
            attempt: job.attempt,
            result,
        };
        match self.store.transition(job.id, transition).await? {
            Some(done) => {
                self.broker.ack(delivery).await?;
                metrics::counter!("jobs_completed_total", "job_type" => done.job_type.to_string())
                    .increment(1);
                info!(job_id = %done.id, attempt = done.attempt, "Job completed");
                self.sink.emit(&done.owner_id, PushEvent::for_job(&done)).await;
            }
            None => {
                info!(job_id = %job.id, "Result discarded, job no longer processing");
                self.broker.ack(delivery).await?;
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        job: &Job,
        error: ExecutionError,
    ) -> Result<(), ConsumerError> {
        match self.policy.decide(&self.binding, job.attempt, &error) {
            RetryDecision::Retry { delay } => self.retry(delivery, job, &error, delay).await,
            decision => {
                let transition = if decision == RetryDecision::DeadLetter {
                    Transition::DeadLetter {
                        attempt: job.attempt,
                        error: error.to_string(),
                    }
                } else {
                    Transition::Fail {
                        attempt: job.attempt,
                        error: error.to_string(),
                    }
                };
                match self.store.transition(job.id, transition).await? {
                    Some(dead) => {
                        self.send_to_dlq(&dead).await;
                        self.broker.ack(delivery).await?;
                        self.sink.emit(&dead.owner_id, PushEvent::for_job(&dead)).await;
                    }
                    None => {
                        info!(job_id = %job.id, "Failure discarded, job no longer processing");
                        self.broker.ack(delivery).await?;
                    }
                }
                Ok(())
            }
        }
    }

    async fn retry(
        &self,
        delivery: &Delivery,
        job: &Job,
        error: &ExecutionError,
        delay: Duration,
    ) -> Result<(), ConsumerError> {
        let Some(queued) = self
            .store
            .transition(job.id, Transition::Retry { attempt: job.attempt })
            .await?
        else {
            info!(job_id = %job.id, "Retry skipped, job no longer processing");
            self.broker.ack(delivery).await?;
            return Ok(());
        };

        let message = QueueMessage::new(queued.id, queued.job_type, queued.payload.clone(), queued.attempt);
        if let Err(e) = self
            .broker
            .publish_delayed(&self.binding.queue, &message, delay)
            .await
        {
            error!(job_id = %queued.id, error = %e, "Failed to schedule retry");
            let transition = Transition::PublishFailed {
                attempt: queued.attempt,
                error: format!("transport error: {e}"),
            };
            if let Some(failed) = self.store.transition(queued.id, transition).await? {
                metrics::counter!("jobs_failed_total", "job_type" => failed.job_type.to_string())
                    .increment(1);
                self.sink.emit(&failed.owner_id, PushEvent::for_job(&failed)).await;
            }
            self.broker.ack(delivery).await?;
            return Ok(());
        }

        self.broker.ack(delivery).await?;
        metrics::counter!("jobs_retried_total", "job_type" => queued.job_type.to_string())
            .increment(1);
        warn!(
            job_id = %queued.id,
            attempt = queued.attempt,
            max_attempts = self.binding.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Job failed, retry scheduled"
        );
        self.sink.emit(&queued.owner_id, PushEvent::retrying(&queued)).await;
        Ok(())
    }

    /// Record a terminal failure on the binding's DLQ. The job store already
    /// holds the outcome, so a DLQ write failure is logged, not retried.
    async fn send_to_dlq(&self, job: &Job) {
        let counter = if job.state == JobState::DeadLettered {
            "jobs_dead_lettered_total"
        } else {
            "jobs_failed_total"
        };
        metrics::counter!(counter, "job_type" => job.job_type.to_string()).increment(1);

        let entry = DeadLetter {
            job_id: job.id,
            job_type: job.job_type,
            owner_id: job.owner_id.clone(),
            payload: job.payload.clone(),
            error: job.error.clone().unwrap_or_default(),
            attempt: job.attempt,
            dead_lettered_at: Utc::now(),
        };
        match self.broker.dead_letter(&self.binding.dlq, &entry).await {
            Ok(()) => warn!(
                job_id = %job.id,
                state = %job.state,
                attempt = job.attempt,
                dlq = %self.binding.dlq,
                error = %entry.error,
                "Job moved to DLQ"
            ),
            Err(e) => error!(job_id = %job.id, dlq = %self.binding.dlq, error = %e, "DLQ write failed"),
        }
    }
}
