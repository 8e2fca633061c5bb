//! Per-owner push fan-out.
//!
//! Connections subscribe under an owner id; [`Fanout::emit`] delivers an
//! event to every live connection of that owner. Delivery is best-effort and
//! at-most-once: owners without connections are skipped, and a connection
//! whose buffer is full misses the event. Pollers recover from the job store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::models::event::PushEvent;

/// Buffered events per connection before new ones are dropped.
const CONNECTION_BUFFER: usize = 64;

/// Destination for job state events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, owner_id: &str, event: PushEvent);
}

type Connections = HashMap<u64, mpsc::Sender<PushEvent>>;

/// In-process routing table from owner id to live connections.
#[derive(Default)]
pub struct Fanout {
    owners: Mutex<HashMap<String, Connections>>,
    next_id: AtomicU64,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `owner_id`. Dropping the returned
    /// [`Subscription`] removes it.
    pub fn subscribe(self: &Arc<Self>, owner_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);

        self.lock()
            .entry(owner_id.to_string())
            .or_default()
            .insert(id, tx);
        metrics::gauge!("push_connections").increment(1.0);

        tracing::debug!(owner_id = %owner_id, connection_id = id, "Push subscription opened");

        Subscription {
            id,
            owner_id: owner_id.to_string(),
            receiver: rx,
            fanout: Arc::clone(self),
        }
    }

    /// Deliver `event` to every connection of `owner_id`. Returns the number
    /// of connections that accepted it.
    pub fn publish(&self, owner_id: &str, event: &PushEvent) -> usize {
        let mut owners = self.lock();
        let Some(connections) = owners.get_mut(owner_id) else {
            return 0;
        };

        let mut delivered = 0;
        connections.retain(|connection_id, tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    owner_id = %owner_id,
                    connection_id = *connection_id,
                    job_id = %event.data.job_id,
                    "Push buffer full, dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if connections.is_empty() {
            owners.remove(owner_id);
        }

        delivered
    }

    /// Number of live connections for `owner_id`.
    pub fn connections(&self, owner_id: &str) -> usize {
        self.lock().get(owner_id).map_or(0, HashMap::len)
    }

    fn unsubscribe(&self, owner_id: &str, id: u64) {
        let mut owners = self.lock();
        if let Some(connections) = owners.get_mut(owner_id) {
            if connections.remove(&id).is_some() {
                metrics::gauge!("push_connections").decrement(1.0);
            }
            if connections.is_empty() {
                owners.remove(owner_id);
            }
        }
        tracing::debug!(owner_id = %owner_id, connection_id = id, "Push subscription closed");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Connections>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.owners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EventSink for Fanout {
    async fn emit(&self, owner_id: &str, event: PushEvent) {
        self.publish(owner_id, &event);
    }
}

/// One live push connection.
pub struct Subscription {
    id: u64,
    owner_id: String,
    receiver: mpsc::Receiver<PushEvent>,
    fanout: Arc<Fanout>,
}

impl Subscription {
    /// Next event for this connection, in emission order.
    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PushEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.fanout.unsubscribe(&self.owner_id, self.id);
    }
}
