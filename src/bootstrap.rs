//! Process wiring shared by the API server and the worker binary.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::AppConfig;
use crate::db::{self, queries::PgJobStore};
use crate::services::executor::{AiServiceClient, ExecutorRegistry};
use crate::services::memory_queue::MemoryBroker;
use crate::services::queue::{Broker, BrokerError, RedisBroker};
use crate::services::store::{JobStore, MemoryJobStore};
use crate::services::topology::{Topology, TopologyError};
use crate::services::transport::{ReconnectPolicy, RedisTransport};

/// Upper bound for one call to the AI service; the consumer's execution
/// timeout still applies on top.
const AI_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("topology: {0}")]
    Topology(#[from] TopologyError),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("AI service client: {0}")]
    Http(#[from] reqwest::Error),
}

pub struct Backends {
    pub store: Arc<dyn JobStore>,
    pub broker: Arc<dyn Broker>,
    /// Present when the broker is Redis.
    pub transport: Option<Arc<RedisTransport>>,
}

pub fn load_topology(config: &AppConfig) -> Result<Arc<Topology>, BootstrapError> {
    let topology = Topology::load(config.topology_file.as_deref())?;
    for binding in topology.bindings() {
        tracing::info!(
            job_type = %binding.job_type,
            queue = %binding.queue,
            dlq = %binding.dlq,
            max_attempts = binding.max_attempts,
            base_backoff_ms = binding.base_backoff_ms,
            "Queue binding loaded"
        );
    }
    Ok(Arc::new(topology))
}

/// Postgres when `DATABASE_URL` is set (migrations applied), memory otherwise.
pub async fn connect_store(config: &AppConfig) -> Result<Arc<dyn JobStore>, BootstrapError> {
    match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL job store");
            let pool = db::init_pool(url, config.database_max_connections).await?;
            tracing::info!("Running database migrations");
            db::run_migrations(&pool).await?;
            Ok(Arc::new(PgJobStore::new(pool)))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, jobs are kept in memory");
            Ok(Arc::new(MemoryJobStore::new()))
        }
    }
}

/// Redis when `REDIS_URL` is set, an in-process broker otherwise.
pub async fn connect_backends(config: &AppConfig) -> Result<Backends, BootstrapError> {
    let store = connect_store(config).await?;
    match &config.redis_url {
        Some(url) => {
            tracing::info!("Connecting to Redis broker");
            let transport = RedisTransport::connect(url, ReconnectPolicy::default()).await?;
            Ok(Backends {
                store,
                broker: Arc::new(RedisBroker::new(transport.clone())),
                transport: Some(transport),
            })
        }
        None => {
            tracing::warn!("REDIS_URL not set, using in-memory broker");
            Ok(Backends {
                store,
                broker: Arc::new(MemoryBroker::new()),
                transport: None,
            })
        }
    }
}

pub fn http_executors(config: &AppConfig, topology: &Topology) -> Result<ExecutorRegistry, BootstrapError> {
    let client = AiServiceClient::new(
        &config.ai_service_url,
        config.ai_service_token.clone(),
        AI_REQUEST_TIMEOUT,
    )?;
    Ok(ExecutorRegistry::http(topology, Arc::new(client)))
}

/// Flips the returned channel to `true` on Ctrl-C or SIGTERM.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    let signal_tx = tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received");
        let _ = signal_tx.send(true);
    });
    (tx, rx)
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
