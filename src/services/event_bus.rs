//! Cross-process push relay over Redis pub/sub.
//!
//! Worker processes publish [`OwnedEvent`]s on [`EVENTS_CHANNEL`]; each API
//! process relays them into its local [`Fanout`]. Pub/sub is fire-and-forget,
//! matching the push channel's at-most-once delivery.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::models::event::{OwnedEvent, PushEvent};
use crate::services::fanout::{EventSink, Fanout};
use crate::services::transport::{ReconnectPolicy, RedisTransport};

pub const EVENTS_CHANNEL: &str = "jobs:events";

/// [`EventSink`] that publishes to Redis instead of local connections.
pub struct RedisEventBus {
    transport: Arc<RedisTransport>,
}

impl RedisEventBus {
    pub fn new(transport: Arc<RedisTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl EventSink for RedisEventBus {
    async fn emit(&self, owner_id: &str, event: PushEvent) {
        let envelope = OwnedEvent {
            owner_id: owner_id.to_string(),
            event,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode push event");
                return;
            }
        };

        let mut conn = match self.transport.connection() {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!(error = %e, "Push event dropped, transport closed");
                return;
            }
        };
        let result = conn.publish::<_, _, ()>(EVENTS_CHANNEL, payload).await;
        if let Err(e) = self.transport.observe(result) {
            tracing::warn!(
                owner_id = %owner_id,
                job_id = %envelope.event.data.job_id,
                error = %e,
                "Push event dropped"
            );
        }
    }
}

/// Subscribe to [`EVENTS_CHANNEL`] and deliver into `fanout` until shutdown.
/// Resubscribes with backoff when the subscription drops.
pub async fn relay(client: redis::Client, fanout: Arc<Fanout>, mut shutdown: watch::Receiver<bool>) {
    let policy = ReconnectPolicy::default();
    let mut failures = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let subscribed = async {
            let mut pubsub = client.get_async_pubsub().await?;
            pubsub.subscribe(EVENTS_CHANNEL).await?;
            Ok::<_, redis::RedisError>(pubsub)
        }
        .await;

        match subscribed {
            Ok(mut pubsub) => {
                failures = 0;
                tracing::info!(channel = EVENTS_CHANNEL, "Push relay subscribed");
                let mut messages = pubsub.on_message();
                loop {
                    tokio::select! {
                        message = messages.next() => match message {
                            Some(message) => deliver(&fanout, message),
                            None => {
                                tracing::warn!("Push relay subscription dropped");
                                break;
                            }
                        },
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                tracing::info!("Push relay stopped");
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Push relay subscribe failed");
            }
        }

        let delay = policy.delay(failures);
        failures = failures.saturating_add(1);
        tokio::select! {
            _ = sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    tracing::info!("Push relay stopped");
}

fn deliver(fanout: &Fanout, message: redis::Msg) {
    let payload: String = match message.get_payload() {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "Unreadable push relay message");
            return;
        }
    };
    match serde_json::from_str::<OwnedEvent>(&payload) {
        Ok(envelope) => {
            fanout.publish(&envelope.owner_id, &envelope.event);
        }
        Err(e) => tracing::warn!(error = %e, "Malformed push relay message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{Job, JobType};

    #[test]
    fn test_envelope_wire_format() {
        let job = Job::new(JobType::SizeInference, serde_json::json!({}), "u9");
        let envelope = OwnedEvent {
            owner_id: "u9".into(),
            event: PushEvent::for_job(&job),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["owner_id"], "u9");
        assert_eq!(value["event"]["event"], "job:status");
        assert_eq!(value["event"]["data"]["state"], "QUEUED");
    }
}
