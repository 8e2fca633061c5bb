//! Owned broker transport.
//!
//! Wraps a Redis [`ConnectionManager`] shared by every producer and consumer
//! in the process. The manager re-establishes dropped connections on the
//! next command; this type tracks availability on top of it, probes the
//! server with capped exponential backoff while it is unreachable, and
//! notifies `on_reconnect` subscribers once it is back.

use redis::aio::ConnectionManager;
use redis::RedisError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::services::queue::BrokerError;

/// Backoff used for the initial connect and for reconnect probes.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Attempts for the initial connect before giving up.
    pub connect_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            connect_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.min(16);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub struct RedisTransport {
    client: redis::Client,
    manager: ConnectionManager,
    policy: ReconnectPolicy,
    available: AtomicBool,
    closed: AtomicBool,
    generation: AtomicU64,
    reconnects: broadcast::Sender<u64>,
}

impl RedisTransport {
    /// Connect, retrying with backoff, and start the availability probe.
    pub async fn connect(url: &str, policy: ReconnectPolicy) -> Result<Arc<Self>, BrokerError> {
        let client = redis::Client::open(url)?;

        let mut failures = 0;
        let manager = loop {
            match ConnectionManager::new(client.clone()).await {
                Ok(manager) => break manager,
                Err(e) if failures + 1 < policy.connect_attempts => {
                    let delay = policy.delay(failures);
                    tracing::warn!(
                        error = %e,
                        attempt = failures + 1,
                        retry_in_ms = delay.as_millis() as u64,
                        "Redis connection failed, retrying"
                    );
                    failures += 1;
                    sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let (reconnects, _) = broadcast::channel(16);
        let transport = Arc::new(Self {
            client,
            manager,
            policy,
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            reconnects,
        });

        tokio::spawn(probe(Arc::downgrade(&transport)));
        tracing::info!("Redis transport connected");
        Ok(transport)
    }

    /// A handle for issuing commands. Cheap to clone.
    pub fn connection(&self) -> Result<ConnectionManager, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(self.manager.clone())
    }

    /// Underlying client, for dedicated connections such as pub/sub.
    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    pub fn is_available(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.available.load(Ordering::Acquire)
    }

    /// Fires with a reconnect counter each time the transport recovers.
    pub fn on_reconnect(&self) -> broadcast::Receiver<u64> {
        self.reconnects.subscribe()
    }

    /// Feed a command result back into availability tracking.
    pub fn observe<T>(&self, result: Result<T, RedisError>) -> Result<T, BrokerError> {
        match result {
            Ok(value) => {
                self.mark_up();
                Ok(value)
            }
            Err(e) => {
                if is_connection_error(&e) {
                    self.mark_down(&e);
                }
                Err(e.into())
            }
        }
    }

    pub async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;
        let result = redis::cmd("PING").query_async::<String>(&mut conn).await;
        self.observe(result).map(|_| ())
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("Redis transport closed");
        }
    }

    fn mark_down(&self, error: &RedisError) {
        if self.available.swap(false, Ordering::AcqRel) {
            tracing::error!(error = %error, "Redis transport disconnected");
        }
    }

    fn mark_up(&self) {
        if !self.available.swap(true, Ordering::AcqRel) {
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::info!(reconnects = generation, "Redis transport reconnected");
            // No receivers is fine.
            let _ = self.reconnects.send(generation);
        }
    }
}

fn is_connection_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

/// Ping while the transport is down so it recovers without traffic.
async fn probe(transport: Weak<RedisTransport>) {
    let mut failures = 0u32;
    loop {
        let delay = match transport.upgrade() {
            Some(t) if t.closed.load(Ordering::Acquire) => return,
            Some(t) if !t.available.load(Ordering::Acquire) => {
                if t.ping().await.is_ok() {
                    failures = 0;
                } else {
                    failures += 1;
                }
                t.policy.delay(failures)
            }
            Some(t) => t.policy.initial_delay,
            None => return,
        };
        sleep(delay).await;
    }
}
