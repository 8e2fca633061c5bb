//! In-process broker for development and tests. Same delivery semantics as
//! the Redis broker, without durability across restarts.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::services::queue::{Broker, BrokerError, DeadLetter, Delivery, QueueMessage};
use crate::services::topology::QueueBinding;

#[derive(Default)]
struct Queues {
    ready: HashMap<String, VecDeque<String>>,
    /// Keyed by (queue, consumer).
    processing: HashMap<(String, String), Vec<String>>,
    dead: HashMap<String, Vec<DeadLetter>>,
}

#[derive(Default, Clone)]
pub struct MemoryBroker {
    queues: Arc<Mutex<Queues>>,
    unavailable: Arc<AtomicBool>,
    failing_publishes: Arc<AtomicU32>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the broker connection.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Release);
    }

    /// Reject the next `count` publishes while still reporting available,
    /// as a broker that drops the connection mid-publish would.
    pub fn fail_next_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::Release);
    }

    /// Messages currently held by a consumer.
    pub fn in_flight(&self, queue: &str, consumer: &str) -> usize {
        self.lock()
            .processing
            .get(&(queue.to_string(), consumer.to_string()))
            .map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> Result<(), BrokerError> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(BrokerError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn push(&self, queue: &str, raw: String) {
        self.lock()
            .ready
            .entry(queue.to_string())
            .or_default()
            .push_back(raw);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::Acquire)
    }

    async fn publish(&self, queue: &str, message: &QueueMessage) -> Result<(), BrokerError> {
        self.check()?;
        if self
            .failing_publishes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BrokerError::Unavailable);
        }
        let raw = serde_json::to_string(message)?;
        self.push(queue, raw);
        Ok(())
    }

    async fn publish_delayed(
        &self,
        queue: &str,
        message: &QueueMessage,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        self.check()?;
        let raw = serde_json::to_string(message)?;
        let broker = self.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            broker.push(&queue, raw);
        });
        Ok(())
    }

    async fn receive(
        &self,
        binding: &QueueBinding,
        consumer: &str,
    ) -> Result<Option<Delivery>, BrokerError> {
        self.check()?;
        let mut queues = self.lock();
        let Some(raw) = queues
            .ready
            .get_mut(&binding.queue)
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };

        queues
            .processing
            .entry((binding.queue.clone(), consumer.to_string()))
            .or_default()
            .push(raw.clone());
        drop(queues);

        Ok(Some(Delivery::new(&binding.queue, consumer, raw)?))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.check()?;
        let mut queues = self.lock();
        let key = (delivery.queue.clone(), delivery.consumer.clone());
        if let Some(held) = queues.processing.get_mut(&key) {
            if let Some(pos) = held.iter().position(|r| r == delivery.raw()) {
                held.remove(pos);
            }
        }
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.ack(delivery).await?;
        self.push(&delivery.queue, delivery.raw().to_string());
        Ok(())
    }

    async fn dead_letter(&self, dlq: &str, entry: &DeadLetter) -> Result<(), BrokerError> {
        self.check()?;
        self.lock()
            .dead
            .entry(dlq.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn dead_letters(&self, dlq: &str, limit: usize) -> Result<Vec<DeadLetter>, BrokerError> {
        self.check()?;
        Ok(self
            .lock()
            .dead
            .get(dlq)
            .map(|entries| entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_dead_letter(
        &self,
        dlq: &str,
        job_id: Uuid,
    ) -> Result<Option<DeadLetter>, BrokerError> {
        self.check()?;
        let mut queues = self.lock();
        let Some(entries) = queues.dead.get_mut(dlq) else {
            return Ok(None);
        };
        Ok(entries
            .iter()
            .position(|e| e.job_id == job_id)
            .map(|pos| entries.remove(pos)))
    }

    async fn recover(&self, queue: &str, consumer: &str) -> Result<u64, BrokerError> {
        self.check()?;
        let mut queues = self.lock();
        let held = queues
            .processing
            .remove(&(queue.to_string(), consumer.to_string()))
            .unwrap_or_default();
        let count = held.len() as u64;
        queues
            .ready
            .entry(queue.to_string())
            .or_default()
            .extend(held);
        Ok(count)
    }

    async fn promote_due(&self, _queue: &str) -> Result<u64, BrokerError> {
        // Delayed publishes are timer-driven here.
        Ok(0)
    }

    async fn depth(&self, queue: &str) -> Result<u64, BrokerError> {
        self.check()?;
        Ok(self.lock().ready.get(queue).map_or(0, |q| q.len() as u64))
    }

    async fn health_check(&self) -> Result<(), BrokerError> {
        self.check()
    }
}
