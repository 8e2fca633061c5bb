use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;

use crate::services::consumer::{Consumer, ConsumerConfig};
use crate::services::executor::ExecutorRegistry;
use crate::services::fanout::EventSink;
use crate::services::queue::Broker;
use crate::services::recovery::{run_promoter, run_reconnect_recovery, StallReaper};
use crate::services::retry::RetryPolicy;
use crate::services::store::JobStore;
use crate::services::topology::Topology;

/// Everything a worker process runs: one consumer per bound job type plus
/// the stall reaper, the delayed-retry promoter and, with a reconnecting
/// transport, redelivery after reconnects.
pub struct WorkerPool {
    pub topology: Arc<Topology>,
    pub store: Arc<dyn JobStore>,
    pub broker: Arc<dyn Broker>,
    pub sink: Arc<dyn EventSink>,
    pub executors: ExecutorRegistry,
    pub policy: RetryPolicy,
    pub consumer: ConsumerConfig,
    pub stall_timeout: Duration,
    /// From [`RedisTransport::on_reconnect`](crate::services::transport::RedisTransport::on_reconnect).
    pub reconnects: Option<broadcast::Receiver<u64>>,
}

impl WorkerPool {
    /// Spawn all tasks. They stop once `shutdown` flips to `true`.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinSet<()> {
        let mut tasks = JoinSet::new();

        for binding in self.topology.bindings() {
            let Some(executor) = self.executors.get(binding.job_type) else {
                tracing::warn!(
                    job_type = %binding.job_type,
                    queue = %binding.queue,
                    "No executor registered, queue not consumed"
                );
                continue;
            };
            let consumer = Arc::new(Consumer::new(
                binding.clone(),
                self.broker.clone(),
                self.store.clone(),
                self.sink.clone(),
                executor,
                self.policy.clone(),
                self.consumer.clone(),
            ));
            tasks.spawn(consumer.run(shutdown.clone()));
        }

        let reaper = Arc::new(StallReaper::new(
            self.topology.clone(),
            self.store.clone(),
            self.broker.clone(),
            self.sink.clone(),
            self.stall_timeout,
            self.policy.max_backoff(),
        ));
        // Sweep a few times per stall window.
        let sweep_every = (self.stall_timeout / 4).max(Duration::from_secs(1));
        tasks.spawn(reaper.run(sweep_every, shutdown.clone()));

        if let Some(reconnects) = self.reconnects {
            tasks.spawn(run_reconnect_recovery(
                self.topology.clone(),
                self.broker.clone(),
                self.consumer.consumer_id.clone(),
                reconnects,
                shutdown.clone(),
            ));
        }

        tasks.spawn(run_promoter(
            self.topology,
            self.broker,
            self.consumer.poll_interval,
            shutdown,
        ));

        tasks
    }
}
