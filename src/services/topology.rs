//! Queue topology: which queue, dead-letter queue and retry budget each job
//! type uses. Loaded once at startup and shared read-only by producers and
//! consumers.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::models::job::JobType;

/// Static routing and retry settings for one job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueBinding {
    pub job_type: JobType,
    pub queue: String,
    pub dlq: String,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    /// Path on the AI service that executes this job type.
    pub executor_path: String,
}

impl QueueBinding {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }
}

/// Registry of all queue bindings, keyed by job type.
#[derive(Debug, Clone)]
pub struct Topology {
    bindings: HashMap<JobType, QueueBinding>,
}

impl Topology {
    /// Build a registry, rejecting inconsistent bindings.
    pub fn new(bindings: Vec<QueueBinding>) -> Result<Self, TopologyError> {
        let mut by_type = HashMap::new();
        let mut names = HashSet::new();

        for binding in bindings {
            if binding.queue.trim().is_empty() || binding.dlq.trim().is_empty() {
                return Err(TopologyError::EmptyName(binding.job_type));
            }
            if binding.queue == binding.dlq {
                return Err(TopologyError::SharedDlq(binding.job_type));
            }
            if binding.max_attempts == 0 {
                return Err(TopologyError::ZeroAttempts(binding.job_type));
            }
            for name in [&binding.queue, &binding.dlq] {
                if !names.insert(name.clone()) {
                    return Err(TopologyError::DuplicateQueue(name.clone()));
                }
            }
            if by_type.contains_key(&binding.job_type) {
                return Err(TopologyError::DuplicateType(binding.job_type));
            }
            by_type.insert(binding.job_type, binding);
        }

        if by_type.is_empty() {
            return Err(TopologyError::Empty);
        }

        Ok(Self { bindings: by_type })
    }

    /// The storefront's AI queues.
    pub fn default_bindings() -> Vec<QueueBinding> {
        vec![
            QueueBinding {
                job_type: JobType::ImageGeneration,
                queue: "ai.tryon".to_string(),
                dlq: "ai.tryon.dlq".to_string(),
                max_attempts: 3,
                base_backoff_ms: 1000,
                executor_path: "/api/v1/ai/try-on".to_string(),
            },
            QueueBinding {
                job_type: JobType::SizeInference,
                queue: "ai.size".to_string(),
                dlq: "ai.size.dlq".to_string(),
                max_attempts: 3,
                base_backoff_ms: 1000,
                executor_path: "/api/v1/ai/size-recommend".to_string(),
            },
            QueueBinding {
                job_type: JobType::ChatTurn,
                queue: "ai.chat".to_string(),
                dlq: "ai.chat.dlq".to_string(),
                max_attempts: 2,
                base_backoff_ms: 1000,
                executor_path: "/api/v1/ai/chat".to_string(),
            },
        ]
    }

    /// Load bindings from a JSON file (an array of [`QueueBinding`]), or
    /// fall back to the defaults when no file is configured.
    pub fn load(path: Option<&Path>) -> Result<Self, TopologyError> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| TopologyError::Read(path.display().to_string(), e))?;
                let bindings: Vec<QueueBinding> = serde_json::from_str(&raw)?;
                Self::new(bindings)
            }
            None => Self::new(Self::default_bindings()),
        }
    }

    pub fn binding(&self, job_type: JobType) -> Option<&QueueBinding> {
        self.bindings.get(&job_type)
    }

    /// Resolve a wire type name to its binding.
    pub fn resolve(&self, job_type: &str) -> Option<&QueueBinding> {
        job_type
            .parse::<JobType>()
            .ok()
            .and_then(|t| self.binding(t))
    }

    pub fn bindings(&self) -> impl Iterator<Item = &QueueBinding> {
        self.bindings.values()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("topology declares no queues")]
    Empty,

    #[error("queue or DLQ name is empty for {0}")]
    EmptyName(JobType),

    #[error("{0} uses its primary queue as its DLQ")]
    SharedDlq(JobType),

    #[error("{0} must allow at least one attempt")]
    ZeroAttempts(JobType),

    #[error("queue {0} is bound more than once")]
    DuplicateQueue(String),

    #[error("{0} is bound more than once")]
    DuplicateType(JobType),

    #[error("failed to read topology file {0}: {1}")]
    Read(String, #[source] std::io::Error),

    #[error("invalid topology file: {0}")]
    Parse(#[from] serde_json::Error),
}
