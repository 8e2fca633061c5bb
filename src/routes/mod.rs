pub mod admin;
pub mod auth;
pub mod error;
pub mod events;
pub mod health;
pub mod jobs;
pub mod metrics;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// Request bodies carry job payloads, not uploads.
const BODY_LIMIT: usize = 1024 * 1024;

/// Build the HTTP API. `/metrics` is mounted only when a recorder handle is
/// given.
pub fn router(state: AppState, prometheus: Option<Arc<PrometheusHandle>>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health::health_check))
        .route("/ws", get(events::push_channel))
        .route("/api/v1/jobs", post(jobs::submit_job))
        .route(
            "/api/v1/jobs/{job_id}",
            get(jobs::get_job_status).delete(jobs::cancel_job),
        )
        .route("/api/v1/admin/jobs", get(admin::list_jobs))
        .route("/api/v1/admin/jobs/stats", get(admin::job_stats))
        .route(
            "/api/v1/admin/jobs/{job_id}",
            get(admin::get_job).delete(admin::cancel_job),
        )
        .route("/api/v1/admin/dlq/{job_type}", get(admin::list_dead_letters))
        .route(
            "/api/v1/admin/dlq/{job_type}/{job_id}/replay",
            post(admin::replay_dead_letter),
        )
        .with_state(state);

    if let Some(handle) = prometheus {
        app = app.route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(handle),
        );
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
}
