//! HTTP API tests. Each test serves the router on an ephemeral port with
//! in-memory backends and talks to it over reqwest.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use job_pipeline::app_state::AppState;
use job_pipeline::routes;
use job_pipeline::services::auth::{TokenVerifier, ADMIN_ROLE};
use job_pipeline::services::consumer::ConsumerConfig;
use job_pipeline::services::executor::{ExecutionContext, ExecutionError, ExecutorRegistry, JobExecutor};
use job_pipeline::services::fanout::Fanout;
use job_pipeline::services::memory_queue::MemoryBroker;
use job_pipeline::services::retry::RetryPolicy;
use job_pipeline::services::store::MemoryJobStore;
use job_pipeline::services::topology::Topology;
use job_pipeline::services::worker_pool::WorkerPool;

const SECRET: &str = "api-test-secret";

struct Echo;

#[async_trait]
impl JobExecutor for Echo {
    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, ExecutionError> {
        if ctx.payload["reject"] == true {
            return Err(ExecutionError::Permanent("rejected by executor".into()));
        }
        Ok(json!({"echo": ctx.payload}))
    }
}

struct TestServer {
    base: String,
    client: reqwest::Client,
    verifier: TokenVerifier,
    broker: Arc<MemoryBroker>,
    _shutdown: watch::Sender<bool>,
}

impl TestServer {
    /// `with_workers` runs an embedded pool that echoes every payload.
    async fn start(with_workers: bool) -> Self {
        let topology = Arc::new(Topology::new(Topology::default_bindings()).unwrap());
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let fanout = Arc::new(Fanout::new());
        let (shutdown, shutdown_rx) = watch::channel(false);

        if with_workers {
            let mut executors = ExecutorRegistry::new();
            for binding in topology.bindings() {
                executors = executors.register(binding.job_type, Arc::new(Echo));
            }
            let pool = WorkerPool {
                topology: topology.clone(),
                store: store.clone(),
                broker: broker.clone(),
                sink: fanout.clone(),
                executors,
                policy: RetryPolicy::new(0.0, Duration::from_secs(5)),
                consumer: ConsumerConfig {
                    poll_interval: Duration::from_millis(20),
                    ..ConsumerConfig::default()
                },
                stall_timeout: Duration::from_secs(60),
                reconnects: None,
            };
            let mut workers = pool.spawn(shutdown_rx.clone());
            tokio::spawn(async move { while workers.join_next().await.is_some() {} });
        }

        let state = AppState::new(
            topology,
            store,
            broker.clone(),
            fanout.clone(),
            fanout,
            TokenVerifier::new(SECRET),
        );
        let app = routes::router(state, None);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut stop = shutdown_rx;
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.wait_for(|stopping| *stopping).await;
                })
                .await
                .unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            verifier: TokenVerifier::new(SECRET),
            broker,
            _shutdown: shutdown,
        }
    }

    fn token(&self, sub: &str, roles: &[&str]) -> String {
        self.verifier
            .issue(sub, roles, chrono::Duration::minutes(5))
            .unwrap()
    }

    fn get(&self, path: &str, token: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{path}", self.base))
            .bearer_auth(token)
    }

    async fn submit(&self, token: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}/api/v1/jobs", self.base))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn submit_ok(&self, token: &str, body: Value) -> Uuid {
        let response = self.submit(token, body).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body: Value = response.json().await.unwrap();
        body["job_id"].as_str().unwrap().parse().unwrap()
    }

    async fn poll_until_terminal(&self, token: &str, job_id: Uuid) -> Value {
        for _ in 0..250 {
            let body: Value = self
                .get(&format!("/api/v1/jobs/{job_id}"), token)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if body["terminal"] == true {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} did not finish");
    }
}

#[tokio::test]
async fn test_health_reports_components() {
    let server = TestServer::start(false).await;
    let response = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    server.broker.set_available(false);
    let response = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_requests_without_valid_token_are_rejected() {
    let server = TestServer::start(false).await;

    let response = server
        .client
        .post(format!("{}/api/v1/jobs", server.base))
        .json(&json!({"job_type": "chat-turn"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let forged = TokenVerifier::new("some-other-secret")
        .issue("u1", &[], chrono::Duration::minutes(5))
        .unwrap();
    let response = server.submit(&forged, json!({"job_type": "chat-turn"})).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn test_submit_returns_queued_job() {
    let server = TestServer::start(false).await;
    let token = server.token("u1", &[]);

    let response = server
        .submit(&token, json!({"job_type": "size-inference", "payload": {"height_cm": 172}}))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["state"], "QUEUED");
    assert_eq!(body["message"], "Job queued");

    let job_id = body["job_id"].as_str().unwrap();
    let status: Value = server
        .get(&format!("/api/v1/jobs/{job_id}"), &token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["state"], "QUEUED");
    assert_eq!(status["job_type"], "size-inference");
    assert_eq!(status["attempt"], 0);
    assert_eq!(status["terminal"], false);
}

#[tokio::test]
async fn test_submit_rejects_bad_requests() {
    let server = TestServer::start(false).await;
    let token = server.token("u1", &[]);

    let response = server.submit(&token, json!({"job_type": "video-render"})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "unknown_job_type");

    let response = server.submit(&token, json!({"job_type": ""})).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_submit_fails_fast_when_broker_is_down() {
    let server = TestServer::start(false).await;
    let token = server.token("u1", &[]);
    server.broker.set_available(false);

    let response = server.submit(&token, json!({"job_type": "chat-turn"})).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_jobs_are_scoped_to_their_owner() {
    let server = TestServer::start(false).await;
    let owner = server.token("u1", &[]);
    let stranger = server.token("u2", &[]);
    let job_id = server.submit_ok(&owner, json!({"job_type": "chat-turn"})).await;

    let response = server
        .get(&format!("/api/v1/jobs/{job_id}"), &stranger)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = server
        .client
        .delete(format!("{}/api/v1/jobs/{job_id}", server.base))
        .bearer_auth(&stranger)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = server
        .get(&format!("/api/v1/jobs/{}", Uuid::new_v4()), &owner)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let server = TestServer::start(false).await;
    let token = server.token("u1", &[]);
    let job_id = server.submit_ok(&token, json!({"job_type": "image-generation"})).await;

    let url = format!("{}/api/v1/jobs/{job_id}", server.base);
    let response = server.client.delete(&url).bearer_auth(&token).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["state"], "CANCELLED");
    assert_eq!(body["terminal"], true);
    assert_eq!(body["error"], "cancelled by user");

    let response = server.client.delete(&url).bearer_auth(&token).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_submitted_job_completes_and_is_pollable() {
    let server = TestServer::start(true).await;
    let token = server.token("u1", &[]);

    let job_id = server
        .submit_ok(&token, json!({"job_type": "chat-turn", "payload": {"message": "hi"}}))
        .await;
    let done = server.poll_until_terminal(&token, job_id).await;
    assert_eq!(done["state"], "COMPLETED");
    assert_eq!(done["attempt"], 1);
    assert_eq!(done["result"]["echo"]["message"], "hi");
    assert!(done["error"].is_null());
}

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let server = TestServer::start(false).await;
    let user = server.token("u1", &[]);
    let admin = server.token("ops", &[ADMIN_ROLE]);
    server.submit_ok(&user, json!({"job_type": "chat-turn"})).await;

    let response = server.get("/api/v1/admin/jobs", &user).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = server.get("/api/v1/admin/jobs", &admin).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page: Value = response.json().await.unwrap();
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["owner_id"], "u1");

    let stats: Value = server
        .get("/api/v1/admin/jobs/stats", &admin)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["jobs"]["total"], 1);
    assert_eq!(stats["jobs"]["queued"], 1);
    let chat = stats["queues"]
        .as_array()
        .unwrap()
        .iter()
        .find(|q| q["queue"] == "ai.chat")
        .unwrap();
    assert_eq!(chat["depth"], 1);
}

#[tokio::test]
async fn test_admin_replays_dead_letter_as_new_job() {
    let server = TestServer::start(true).await;
    let user = server.token("u1", &[]);
    let admin = server.token("ops", &[ADMIN_ROLE]);

    let job_id = server
        .submit_ok(&user, json!({"job_type": "size-inference", "payload": {"reject": true}}))
        .await;
    let failed = server.poll_until_terminal(&user, job_id).await;
    assert_eq!(failed["state"], "FAILED");

    let dead: Value = server
        .get("/api/v1/admin/dlq/size-inference", &admin)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(dead.as_array().unwrap().len(), 1);
    assert_eq!(dead[0]["job_id"], job_id.to_string());

    let response = server
        .client
        .post(format!(
            "{}/api/v1/admin/dlq/size-inference/{job_id}/replay",
            server.base
        ))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let replay: Value = response.json().await.unwrap();
    assert_ne!(replay["job_id"], job_id.to_string());

    // The replayed job belongs to the original owner.
    let replayed: Uuid = replay["job_id"].as_str().unwrap().parse().unwrap();
    let again = server.poll_until_terminal(&user, replayed).await;
    assert_eq!(again["state"], "FAILED");

    let original = server
        .get(&format!("/api/v1/jobs/{job_id}"), &user)
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(original["state"], "FAILED");
}
