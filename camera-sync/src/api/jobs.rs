//! Job submission and polling endpoints.

use super::job_tracker::{JobStatus, JobTracker};
use super::{ApiError, AppState};
use crate::config::Config;
use crate::executor::{CameraCopyJob, JobKind, TransferExecutor};
use crate::utils::errors::{Result, SyncError};
use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct StartJobResponse {
    pub job_id: String,
}

/// Submit a camera copy using `config`.
pub async fn start_camera_copy(tracker: &JobTracker, config: Config) -> Result<String> {
    tracker
        .submit(JobKind::CameraCopy, move |reporter| async move {
            info!(job_id = %reporter.job_id(), "Camera copy running");
            let cancel = reporter.cancellation();
            let camera = CameraCopyJob::from_config(&config.copy);
            TransferExecutor::with_cancel(Arc::new(reporter), cancel)
                .run_camera_copy(&config, camera)
                .await
        })
        .await
}

/// Submit a cloud transfer using `config`.
pub async fn start_cloud_transfer(tracker: &JobTracker, config: Config) -> Result<String> {
    tracker
        .submit(JobKind::CloudTransfer, move |reporter| async move {
            info!(job_id = %reporter.job_id(), "Cloud transfer running");
            let cancel = reporter.cancellation();
            TransferExecutor::with_cancel(Arc::new(reporter), cancel)
                .run_cloud_transfer(&config)
                .await
        })
        .await
}

/// POST /jobs/copy - Copy new images off the camera
pub async fn start_copy(State(state): State<AppState>) -> std::result::Result<Json<StartJobResponse>, ApiError> {
    let config = Config::load(state.config_path.as_deref())?;
    let job_id = start_camera_copy(&state.job_tracker, config).await?;
    Ok(Json(StartJobResponse { job_id }))
}

/// POST /jobs/transfer - Upload the photo store
pub async fn start_transfer(State(state): State<AppState>) -> std::result::Result<Json<StartJobResponse>, ApiError> {
    let config = Config::load(state.config_path.as_deref())?;
    let job_id = start_cloud_transfer(&state.job_tracker, config).await?;
    Ok(Json(StartJobResponse { job_id }))
}

/// GET /jobs/{id} - Poll a job
pub async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<JobStatus>, ApiError> {
    if Uuid::parse_str(&id).is_err() {
        return Err(SyncError::InvalidJobId(id).into());
    }

    state
        .job_tracker
        .poll(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Job not found: {}", id)))
}
