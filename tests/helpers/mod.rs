//! Helpers for end-to-end tests against a running deployment.

use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

use job_pipeline::services::auth::TokenVerifier;

/// Response from POST /api/v1/jobs
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub state: String,
}

/// Response from GET /api/v1/jobs/{job_id}
#[derive(Debug, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub state: String,
    pub attempt: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub terminal: bool,
}

/// Base URL from `API_BASE_URL`, defaulting to localhost.
pub fn base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

/// Mint a token with the deployment's `JWT_SECRET`.
pub fn token_for(sub: &str, roles: &[&str]) -> String {
    dotenvy::dotenv().ok();
    let secret = std::env::var("JWT_SECRET").expect("JWT_SECRET must be set");
    TokenVerifier::new(&secret)
        .issue(sub, roles, chrono::Duration::minutes(30))
        .expect("Failed to sign token")
}

pub async fn submit_job(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
    job_type: &str,
    payload: serde_json::Value,
) -> Result<SubmitResponse, Box<dyn std::error::Error>> {
    let response = client
        .post(format!("{}/api/v1/jobs", base_url))
        .bearer_auth(token)
        .json(&serde_json::json!({"job_type": job_type, "payload": payload}))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(format!("Submit failed with status {}: {}", status, error_text).into());
    }

    Ok(response.json::<SubmitResponse>().await?)
}

/// Poll a job until it reaches a terminal state (with timeout)
pub async fn poll_job_status(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
    job_id: Uuid,
    timeout_secs: u64,
) -> Result<JobStatusResponse, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms

    for attempt in 0..max_attempts {
        let response = client
            .get(format!("{}/api/v1/jobs/{}", base_url, job_id))
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {}", error_text).into());
        }

        let status_response = response.json::<JobStatusResponse>().await?;
        if status_response.terminal {
            return Ok(status_response);
        }
        if attempt % 10 == 0 && attempt > 0 {
            println!(
                "  ... still {} (attempt {}/{})",
                status_response.state, attempt, max_attempts
            );
        }
        sleep(Duration::from_millis(500)).await;
    }

    Err(format!("Job did not finish within {} seconds", timeout_secs).into())
}
