use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::{JobSnapshot, JobState};
use crate::models::submission::{JobStatusResponse, SubmitRequest, SubmitResponse};
use crate::routes::auth::AuthUser;
use crate::routes::error::ApiError;

/// POST /api/v1/jobs: submit a job for the caller.
pub async fn submit_job(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    request.validate()?;

    let submission = state
        .dispatcher
        .submit(&request.job_type, request.payload, &claims.sub)
        .await?;

    let message = match submission.state {
        JobState::Queued => "Job queued",
        _ => "Job could not be queued",
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: submission.job_id,
            state: submission.state,
            message: message.to_string(),
        }),
    ))
}

/// GET /api/v1/jobs/{job_id}: poll one of the caller's jobs.
pub async fn get_job_status(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let snapshot = owned_snapshot(&state, job_id, &claims.sub).await?;
    Ok(Json(snapshot.into()))
}

/// DELETE /api/v1/jobs/{job_id}: cancel one of the caller's jobs.
pub async fn cancel_job(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    owned_snapshot(&state, job_id, &claims.sub).await?;
    let job = state.dispatcher.cancel(job_id, "cancelled by user").await?;
    Ok(Json(JobSnapshot::from(job).into()))
}

async fn owned_snapshot(state: &AppState, job_id: Uuid, owner_id: &str) -> Result<JobSnapshot, ApiError> {
    state
        .status
        .get_owned_status(job_id, owner_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id} not found")))
}
