//! HTTP surface over the submission gateway.
//!
//! - `POST /v1/jobs` submit a conversion
//! - `GET /v1/jobs/{id}` job status
//! - `POST /v1/jobs/{id}/cancel` cancel a job
//! - `GET /health`

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::gateway::{SubmissionGateway, SubmitError};
use crate::job::JobId;
use crate::store::StoreError;
use crate::validate::ValidationIssue;

pub fn router(gateway: SubmissionGateway) -> Router {
    Router::new()
        .route("/v1/jobs", post(submit_job))
        .route("/v1/jobs/:id", get(job_status))
        .route("/v1/jobs/:id/cancel", post(cancel_job))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

#[derive(Debug)]
enum ApiError {
    Validation(Vec<ValidationIssue>),
    NotFound(JobId),
    Unavailable(String),
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::Validation(v) => ApiError::Validation(v.issues),
            SubmitError::Store(e) => e.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!(error = %e, "job store request failed");
        ApiError::Unavailable(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(issues) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": "validation", "issues": issues })),
            )
                .into_response(),
            ApiError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "not_found", "jobId": id })),
            )
                .into_response(),
            ApiError::Unavailable(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "unavailable", "message": message })),
            )
                .into_response(),
        }
    }
}

async fn submit_job(
    State(gateway): State<SubmissionGateway>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let handle = gateway.submit_bytes(&body).await?;
    Ok((StatusCode::ACCEPTED, Json(handle)))
}

async fn job_status(
    State(gateway): State<SubmissionGateway>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = JobId::from(id);
    match gateway.status(&id).await? {
        Some(view) => Ok(Json(view)),
        None => Err(ApiError::NotFound(id)),
    }
}

async fn cancel_job(
    State(gateway): State<SubmissionGateway>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = JobId::from(id);
    match gateway.cancel(&id).await? {
        Some(outcome) => Ok(Json(outcome)),
        None => Err(ApiError::NotFound(id)),
    }
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
