//! Training API Handlers
//!
//! HTTP endpoints for launching and inspecting trainings.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use kiln_core::domain::job::TrainingJob;
use kiln_core::dto::training::LaunchTraining;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::LaunchOutcome;

/// POST /training
/// Launch a training; it continues in the background
pub async fn launch_training(
    State(state): State<AppState>,
    Json(req): Json<LaunchTraining>,
) -> ApiResult<(StatusCode, Json<TrainingJob>)> {
    tracing::info!(
        "Launching training for user {} model {}",
        req.owner_id,
        req.model_name
    );

    match state.orchestrator.submit(req).await? {
        LaunchOutcome::Accepted(job) => Ok((StatusCode::ACCEPTED, Json(job))),
        LaunchOutcome::Duplicate => Err(ApiError::Conflict(
            "A training for this model is already in progress".to_string(),
        )),
        LaunchOutcome::RateLimited { retry_after } => Err(ApiError::RateLimited(retry_after)),
        LaunchOutcome::Rejected(reason) => Err(reason.into()),
        LaunchOutcome::PaymentDeclined => Err(ApiError::Conflict(
            "Payment could not be applied".to_string(),
        )),
    }
}

/// GET /training/{id}
pub async fn get_training(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TrainingJob>> {
    tracing::debug!("Getting training: {}", id);

    let job = state
        .jobs
        .get_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Training {} not found", id)))?;

    Ok(Json(job))
}
