use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::{JobFilter, JobPage, JobSnapshot, JobStats, JobType};
use crate::models::submission::{ListJobsQuery, SubmitResponse};
use crate::routes::auth::AdminUser;
use crate::routes::error::ApiError;
use crate::services::queue::DeadLetter;
use crate::services::topology::QueueBinding;

#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub job_type: JobType,
    pub queue: String,
    pub dlq: String,
    /// `None` when the broker could not be reached.
    pub depth: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct AdminStats {
    pub jobs: JobStats,
    pub queues: Vec<QueueStats>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct DeadLetterQuery {
    #[garde(range(min = 1, max = 500))]
    #[serde(default = "default_dlq_limit")]
    pub limit: usize,
}

fn default_dlq_limit() -> usize {
    50
}

fn parse_job_type(raw: &str) -> Result<JobType, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::UnknownJobType(raw.to_string()))
}

fn binding_for<'a>(state: &'a AppState, raw: &str) -> Result<&'a QueueBinding, ApiError> {
    let job_type = parse_job_type(raw)?;
    state
        .topology
        .binding(job_type)
        .ok_or_else(|| ApiError::UnknownJobType(raw.to_string()))
}

/// GET /api/v1/admin/jobs: paginated listing, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobPage>, ApiError> {
    query.validate()?;
    let filter = JobFilter {
        state: query.state,
        job_type: query.job_type.as_deref().map(parse_job_type).transpose()?,
        page: query.page,
        limit: query.limit,
    };
    Ok(Json(state.store.list(&filter).await?))
}

/// GET /api/v1/admin/jobs/stats
pub async fn job_stats(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<AdminStats>, ApiError> {
    let jobs = state.store.stats().await?;

    let mut queues = Vec::new();
    for binding in state.topology.bindings() {
        let depth = match state.broker.depth(&binding.queue).await {
            Ok(depth) => Some(depth),
            Err(e) => {
                tracing::warn!(queue = %binding.queue, error = %e, "Queue depth unavailable");
                None
            }
        };
        queues.push(QueueStats {
            job_type: binding.job_type,
            queue: binding.queue.clone(),
            dlq: binding.dlq.clone(),
            depth,
        });
    }

    Ok(Json(AdminStats { jobs, queues }))
}

/// GET /api/v1/admin/jobs/{job_id}: any owner's job, with its owner.
pub async fn get_job(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobSnapshot>, ApiError> {
    state
        .status
        .get_status(job_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id} not found")))
}

/// DELETE /api/v1/admin/jobs/{job_id}
pub async fn cancel_job(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let job = state
        .dispatcher
        .cancel(job_id, &format!("cancelled by admin {}", admin.sub))
        .await?;
    Ok(Json(job.into()))
}

/// GET /api/v1/admin/dlq/{job_type}: newest dead letters first.
pub async fn list_dead_letters(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(job_type): Path<String>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    query.validate()?;
    let binding = binding_for(&state, &job_type)?;
    Ok(Json(state.broker.dead_letters(&binding.dlq, query.limit).await?))
}

/// POST /api/v1/admin/dlq/{job_type}/{job_id}/replay: resubmit as a new job.
pub async fn replay_dead_letter(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path((job_type, job_id)): Path<(String, Uuid)>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let binding = binding_for(&state, &job_type)?;
    let submission = state
        .dispatcher
        .replay_dead_letter(binding.job_type, job_id)
        .await?;

    tracing::info!(
        admin = %admin.sub,
        job_id = %job_id,
        replayed_as = %submission.job_id,
        "Dead letter replay requested"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: submission.job_id,
            state: submission.state,
            message: "Dead letter replayed".to_string(),
        }),
    ))
}
