use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::event::PushEvent;
use crate::models::job::JobType;
use crate::services::fanout::EventSink;
use crate::services::topology::Topology;

/// Classified execution failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    /// Timeouts, upstream 5xx, network blips. Retried.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Invalid payload, business-rule rejection. Never retried.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

/// Everything an executor gets to see about the job it runs.
#[derive(Clone)]
pub struct ExecutionContext {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub owner_id: String,
    pub attempt: u32,
    pub payload: serde_json::Value,
    sink: Arc<dyn EventSink>,
}

impl ExecutionContext {
    pub fn new(
        job_id: Uuid,
        job_type: JobType,
        owner_id: String,
        attempt: u32,
        payload: serde_json::Value,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            job_id,
            job_type,
            owner_id,
            attempt,
            payload,
            sink,
        }
    }

    /// Push a `job:status {PROCESSING, progress}` event to the owner.
    pub async fn report_progress(&self, progress: u8) {
        self.sink
            .emit(&self.owner_id, PushEvent::progress(self.job_id, progress))
            .await;
    }
}

/// Type-specific job body.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext) -> Result<serde_json::Value, ExecutionError>;
}

/// Routes each job type to its own executor.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<JobType, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, job_type: JobType, executor: Arc<dyn JobExecutor>) -> Self {
        self.executors.insert(job_type, executor);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobExecutor>> {
        self.executors.get(&job_type).cloned()
    }

    /// One [`HttpExecutor`] per bound job type, all sharing a client.
    pub fn http(topology: &Topology, client: Arc<AiServiceClient>) -> Self {
        topology.bindings().fold(Self::new(), |registry, binding| {
            registry.register(
                binding.job_type,
                Arc::new(HttpExecutor {
                    client: client.clone(),
                    path: binding.executor_path.clone(),
                }),
            )
        })
    }
}

/// Client for the AI inference service.
pub struct AiServiceClient {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    job_id: Uuid,
    user_id: &'a str,
    attempt: u32,
    #[serde(flatten)]
    payload: &'a serde_json::Value,
}

impl AiServiceClient {
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    /// POST the job payload to `path` and return the JSON body.
    pub async fn run(
        &self,
        path: &str,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        let url = format!("{}{}", self.base_url, path);
        let body = InferenceRequest {
            job_id: ctx.job_id,
            user_id: &ctx.owner_id,
            attempt: ctx.attempt,
            payload: &ctx.payload,
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status(status, detail));
        }

        response
            .json()
            .await
            .map_err(|e| ExecutionError::Permanent(format!("malformed AI service response: {e}")))
    }
}

/// Network-level errors are worth retrying; request-building errors are not.
fn classify_transport(err: reqwest::Error) -> ExecutionError {
    if err.is_builder() {
        ExecutionError::Permanent(err.to_string())
    } else {
        ExecutionError::Transient(err.to_string())
    }
}

fn classify_status(status: StatusCode, detail: String) -> ExecutionError {
    let message = format!("AI service returned {status}: {detail}");
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ExecutionError::Transient(message)
    } else {
        ExecutionError::Permanent(message)
    }
}

/// Executes a job by calling one AI service endpoint.
pub struct HttpExecutor {
    client: Arc<AiServiceClient>,
    path: String,
}

#[async_trait]
impl JobExecutor for HttpExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> Result<serde_json::Value, ExecutionError> {
        tracing::debug!(job_id = %ctx.job_id, path = %self.path, "Calling AI service");
        ctx.report_progress(10).await;
        let result = self.client.run(&self.path, &ctx).await?;
        ctx.report_progress(100).await;
        Ok(result)
    }
}
