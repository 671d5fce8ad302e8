//! HTTP API for submitting and polling jobs.

pub mod health;
pub mod job_tracker;
pub mod jobs;

use crate::utils::errors::SyncError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::path::PathBuf;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub job_tracker: job_tracker::JobTracker,
    /// Re-read on every submission so edits apply to the next job
    pub config_path: Option<PathBuf>,
}

impl AppState {
    pub fn new(job_tracker: job_tracker::JobTracker, config_path: Option<PathBuf>) -> Self {
        Self {
            job_tracker,
            config_path,
        }
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        // Job endpoints
        .route("/jobs/copy", post(jobs::start_copy))
        .route("/jobs/transfer", post(jobs::start_transfer))
        .route("/jobs/{id}", get(jobs::job_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::AlreadyRunning(_) => ApiError::Conflict(err.to_string()),
            SyncError::InvalidJobId(_) => ApiError::BadRequest(err.to_string()),
            SyncError::Config(_) | SyncError::Template(_) => ApiError::Unprocessable(err.to_string()),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            ApiError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
            ApiError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}
