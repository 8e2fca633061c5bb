use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::consumer::ConsumerConfig;
use crate::services::retry::RetryPolicy;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string. Without it jobs live in process memory.
    pub database_url: Option<String>,

    /// Upper bound of the Postgres pool; size it for API handlers plus
    /// `worker_prefetch` executions per queue.
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// Redis connection string for the broker and push relay. Without it the
    /// API runs an in-memory broker with embedded workers.
    pub redis_url: Option<String>,

    /// HS256 secret for bearer tokens
    pub jwt_secret: String,

    /// Base URL of the AI inference service
    #[serde(default = "default_ai_service_url")]
    pub ai_service_url: String,

    /// Bearer token sent to the AI inference service
    pub ai_service_token: Option<String>,

    /// JSON file overriding the default queue bindings
    pub topology_file: Option<PathBuf>,

    /// Run consumers inside the API process
    #[serde(default)]
    pub embedded_workers: bool,

    #[serde(default = "default_prefetch")]
    pub worker_prefetch: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,

    /// Upper bound of the random backoff jitter, as a fraction of the delay
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Names this process's processing lists. Must be stable across restarts.
    pub consumer_id: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_ai_service_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_prefetch() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_stall_timeout_ms() -> u64 {
    60_000
}

fn default_execution_timeout_ms() -> u64 {
    120_000
}

fn default_backoff_jitter() -> f64 {
    0.1
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            consumer_id: self
                .consumer_id
                .clone()
                .unwrap_or_else(|| "worker-1".to_string()),
            prefetch: self.worker_prefetch.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            execution_timeout: Duration::from_millis(self.execution_timeout_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.backoff_jitter, Duration::from_millis(self.max_backoff_ms))
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_env() {
        let vars = vec![("JWT_SECRET".to_string(), "s".to_string())];
        let config: AppConfig = envy::from_iter(vars).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert!(config.database_url.is_none());
        assert!(config.redis_url.is_none());
        assert!(!config.embedded_workers);

        let consumer = config.consumer_config();
        assert_eq!(consumer.prefetch, 4);
        assert_eq!(consumer.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.stall_timeout(), Duration::from_secs(60));
        assert_eq!(config.database_max_connections, 10);
    }

    #[test]
    fn test_overrides() {
        let vars = vec![
            ("JWT_SECRET".to_string(), "s".to_string()),
            ("REDIS_URL".to_string(), "redis://localhost:6379".to_string()),
            ("WORKER_PREFETCH".to_string(), "0".to_string()),
            ("EMBEDDED_WORKERS".to_string(), "true".to_string()),
            ("CONSUMER_ID".to_string(), "api-7".to_string()),
        ];
        let config: AppConfig = envy::from_iter(vars).unwrap();
        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert!(config.embedded_workers);
        let consumer = config.consumer_config();
        assert_eq!(consumer.prefetch, 1);
        assert_eq!(consumer.consumer_id, "api-7");
    }

    #[test]
    fn test_missing_secret_is_an_error() {
        let vars: Vec<(String, String)> = Vec::new();
        assert!(envy::from_iter::<_, AppConfig>(vars).is_err());
    }
}
