use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::JobType;
use crate::services::topology::QueueBinding;
use crate::services::transport::RedisTransport;

/// Message body carried on a primary queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    /// Job attempt count at publish time. With `job_id`, the dedup key.
    pub attempt: u32,
    pub published_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(job_id: Uuid, job_type: JobType, payload: serde_json::Value, attempt: u32) -> Self {
        Self {
            job_id,
            job_type,
            payload,
            attempt,
            published_at: Utc::now(),
        }
    }
}

/// A message handed to one consumer. Stays owned by that consumer until it
/// is acknowledged, requeued or recovered.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub consumer: String,
    pub message: QueueMessage,
    raw: String,
}

impl Delivery {
    pub fn new(queue: &str, consumer: &str, raw: String) -> Result<Self, BrokerError> {
        let message = serde_json::from_str(&raw)?;
        Ok(Self {
            queue: queue.to_string(),
            consumer: consumer.to_string(),
            message,
            raw,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Durable record of a job that will not be retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub owner_id: String,
    pub payload: serde_json::Value,
    pub error: String,
    pub attempt: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Message broker operations used by the dispatcher and consumers.
///
/// Implementations must hand each message to at most one consumer at a
/// time and keep it until acknowledged; unacknowledged messages are
/// returned to the queue by [`Broker::recover`].
#[async_trait]
pub trait Broker: Send + Sync {
    /// False while the transport is known to be disconnected.
    fn is_available(&self) -> bool;

    /// Publish and wait for the broker to accept the message.
    async fn publish(&self, queue: &str, message: &QueueMessage) -> Result<(), BrokerError>;

    /// Schedule a publish after `delay` without blocking the caller.
    async fn publish_delayed(
        &self,
        queue: &str,
        message: &QueueMessage,
        delay: Duration,
    ) -> Result<(), BrokerError>;

    /// Take the next message off the binding's queue, if any.
    async fn receive(
        &self,
        binding: &QueueBinding,
        consumer: &str,
    ) -> Result<Option<Delivery>, BrokerError>;

    /// Remove a delivered message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Hand a delivered message back to its queue.
    async fn requeue(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    async fn dead_letter(&self, dlq: &str, entry: &DeadLetter) -> Result<(), BrokerError>;

    /// Most recent DLQ entries first.
    async fn dead_letters(&self, dlq: &str, limit: usize) -> Result<Vec<DeadLetter>, BrokerError>;

    async fn remove_dead_letter(
        &self,
        dlq: &str,
        job_id: Uuid,
    ) -> Result<Option<DeadLetter>, BrokerError>;

    /// Return a consumer's unacknowledged messages to the queue.
    async fn recover(&self, queue: &str, consumer: &str) -> Result<u64, BrokerError>;

    /// Move delayed messages whose time has come onto the queue.
    async fn promote_due(&self, queue: &str) -> Result<u64, BrokerError>;

    /// Messages waiting on the queue.
    async fn depth(&self, queue: &str) -> Result<u64, BrokerError>;

    async fn health_check(&self) -> Result<(), BrokerError>;
}

fn processing_key(queue: &str, consumer: &str) -> String {
    format!("{queue}:processing:{consumer}")
}

fn delayed_key(queue: &str) -> String {
    format!("{queue}:delayed")
}

/// Delayed messages promoted per call.
const PROMOTE_BATCH: usize = 100;

const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    redis.call('LPUSH', KEYS[2], member)
end
return #due
"#;

/// Redis-backed reliable queue.
///
/// Primary queues are lists; a receive moves the message into the
/// consumer's own processing list (`RPOPLPUSH`) and an ack removes it from
/// there. Delayed retries wait in a sorted set scored by due time.
pub struct RedisBroker {
    transport: Arc<RedisTransport>,
    promote: redis::Script,
}

impl RedisBroker {
    pub fn new(transport: Arc<RedisTransport>) -> Self {
        Self {
            transport,
            promote: redis::Script::new(PROMOTE_SCRIPT),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn is_available(&self) -> bool {
        self.transport.is_available()
    }

    async fn publish(&self, queue: &str, message: &QueueMessage) -> Result<(), BrokerError> {
        let mut conn = self.transport.connection()?;
        let payload = serde_json::to_string(message)?;
        let result = conn.lpush::<_, _, ()>(queue, &payload).await;
        self.transport.observe(result)
    }

    async fn publish_delayed(
        &self,
        queue: &str,
        message: &QueueMessage,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self.transport.connection()?;
        let payload = serde_json::to_string(message)?;
        let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let result = conn
            .zadd::<_, _, _, ()>(delayed_key(queue), &payload, due)
            .await;
        self.transport.observe(result)
    }

    async fn receive(
        &self,
        binding: &QueueBinding,
        consumer: &str,
    ) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.transport.connection()?;
        let processing = processing_key(&binding.queue, consumer);
        let result: Result<Option<String>, _> = conn.rpoplpush(&binding.queue, &processing).await;

        let Some(raw) = self.transport.observe(result)? else {
            return Ok(None);
        };

        match Delivery::new(&binding.queue, consumer, raw.clone()) {
            Ok(delivery) => Ok(Some(delivery)),
            Err(e) => {
                // Unparseable messages cannot be tied to a job; park the raw body.
                tracing::error!(queue = %binding.queue, error = %e, "Malformed message moved to DLQ");
                let result = redis::pipe()
                    .atomic()
                    .lrem(&processing, 1, &raw)
                    .ignore()
                    .lpush(&binding.dlq, &raw)
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await;
                self.transport.observe(result)?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.transport.connection()?;
        let result = conn
            .lrem::<_, _, ()>(
                processing_key(&delivery.queue, &delivery.consumer),
                1,
                delivery.raw(),
            )
            .await;
        self.transport.observe(result)
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.transport.connection()?;
        let result = redis::pipe()
            .atomic()
            .lrem(processing_key(&delivery.queue, &delivery.consumer), 1, delivery.raw())
            .ignore()
            .rpush(&delivery.queue, delivery.raw())
            .ignore()
            .query_async::<()>(&mut conn)
            .await;
        self.transport.observe(result)
    }

    async fn dead_letter(&self, dlq: &str, entry: &DeadLetter) -> Result<(), BrokerError> {
        let mut conn = self.transport.connection()?;
        let payload = serde_json::to_string(entry)?;
        let result = conn.lpush::<_, _, ()>(dlq, &payload).await;
        self.transport.observe(result)
    }

    async fn dead_letters(&self, dlq: &str, limit: usize) -> Result<Vec<DeadLetter>, BrokerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.transport.connection()?;
        let result: Result<Vec<String>, _> = conn.lrange(dlq, 0, limit as isize - 1).await;
        let raw = self.transport.observe(result)?;
        Ok(raw
            .iter()
            .filter_map(|r| serde_json::from_str(r).ok())
            .collect())
    }

    async fn remove_dead_letter(
        &self,
        dlq: &str,
        job_id: Uuid,
    ) -> Result<Option<DeadLetter>, BrokerError> {
        let mut conn = self.transport.connection()?;
        let result: Result<Vec<String>, _> = conn.lrange(dlq, 0, -1).await;
        let raw = self.transport.observe(result)?;

        let found = raw.into_iter().find_map(|r| {
            serde_json::from_str::<DeadLetter>(&r)
                .ok()
                .filter(|entry| entry.job_id == job_id)
                .map(|entry| (r, entry))
        });

        let Some((raw, entry)) = found else {
            return Ok(None);
        };
        let result: Result<i64, _> = conn.lrem(dlq, 1, &raw).await;
        let removed = self.transport.observe(result)?;
        // Another operator removed it first.
        Ok((removed > 0).then_some(entry))
    }

    async fn recover(&self, queue: &str, consumer: &str) -> Result<u64, BrokerError> {
        let mut conn = self.transport.connection()?;
        let processing = processing_key(queue, consumer);
        let mut recovered = 0;
        loop {
            let result: Result<Option<String>, _> = conn.rpoplpush(&processing, queue).await;
            match self.transport.observe(result)? {
                Some(_) => recovered += 1,
                None => break,
            }
        }
        Ok(recovered)
    }

    async fn promote_due(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut conn = self.transport.connection()?;
        let now = Utc::now().timestamp_millis();
        let result = self
            .promote
            .key(delayed_key(queue))
            .key(queue)
            .arg(now)
            .arg(PROMOTE_BATCH)
            .invoke_async::<u64>(&mut conn)
            .await;
        self.transport.observe(result)
    }

    async fn depth(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut conn = self.transport.connection()?;
        let result = conn.llen(queue).await;
        self.transport.observe(result)
    }

    async fn health_check(&self) -> Result<(), BrokerError> {
        self.transport.ping().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("broker transport unavailable")]
    Unavailable,

    #[error("broker transport closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        assert_eq!(processing_key("ai.tryon", "worker-1"), "ai.tryon:processing:worker-1");
        assert_eq!(delayed_key("ai.chat"), "ai.chat:delayed");
    }

    #[test]
    fn test_delivery_parses_message() {
        let message = QueueMessage::new(
            Uuid::new_v4(),
            JobType::SizeInference,
            serde_json::json!({"product_id": "p1"}),
            2,
        );
        let raw = serde_json::to_string(&message).unwrap();
        let delivery = Delivery::new("ai.size", "w1", raw.clone()).unwrap();
        assert_eq!(delivery.message, message);
        assert_eq!(delivery.raw(), raw);
        assert!(Delivery::new("ai.size", "w1", "not json".into()).is_err());
    }
}
