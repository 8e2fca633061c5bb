use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::services::auth::AuthError;
use crate::services::dispatcher::SubmitError;
use crate::services::queue::BrokerError;
use crate::services::store::StoreError;

/// Error returned by HTTP handlers. Rendered as `{error, message}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("admin role required")]
    Forbidden,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("{0}")]
    Conflict(String),

    #[error("message broker unavailable, try again later")]
    TransportUnavailable,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_failed"),
            ApiError::UnknownJobType(_) => (StatusCode::BAD_REQUEST, "unknown_job_type"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::TransportUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "transport_unavailable")
            }
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = Json(json!({
            "error": code,
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::UnknownJobType(t) => ApiError::UnknownJobType(t),
            SubmitError::TransportUnavailable => ApiError::TransportUnavailable,
            SubmitError::NotFound(id) => ApiError::NotFound(format!("job {id} not found")),
            e @ SubmitError::NotCancellable { .. } => ApiError::Conflict(e.to_string()),
            SubmitError::Store(e) => e.into(),
            SubmitError::Broker(e) => e.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Unavailable | BrokerError::Closed => ApiError::TransportUnavailable,
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::Unauthorized(e.to_string())
    }
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        ApiError::Validation(report.to_string())
    }
}
