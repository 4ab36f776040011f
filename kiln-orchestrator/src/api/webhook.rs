//! Provider Callback Handler
//!
//! Receives completion callbacks from the training provider. Anything the
//! orchestrator cannot use is acknowledged with 200 so the provider stops
//! redelivering it; only store failures answer 5xx.

use axum::{Json, extract::State, http::HeaderMap};
use kiln_core::dto::webhook::WebhookPayload;
use serde_json::{Value, json};

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};

const TOKEN_HEADER: &str = "x-webhook-token";

/// POST /webhook/training
pub async fn training_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<WebhookPayload>,
) -> ApiResult<Json<Value>> {
    if let Some(secret) = &state.webhook_secret {
        let token = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
        if token != Some(secret.as_str()) {
            tracing::warn!(
                "Rejected callback for provider job {} with bad token",
                payload.job_id
            );
            return Err(ApiError::Unauthorized);
        }
    }

    tracing::debug!(
        "Callback for provider job {}: {}",
        payload.job_id,
        payload.status
    );

    let outcome = state.webhooks.handle(payload).await?;

    Ok(Json(json!({ "accepted": outcome.is_accepted() })))
}
