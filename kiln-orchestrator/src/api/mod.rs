//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod training;
pub mod webhook;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::repository::JobRecordStore;
use crate::service::{Orchestrator, WebhookHandler};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub webhooks: Arc<WebhookHandler>,
    pub jobs: Arc<dyn JobRecordStore>,
    /// Expected `X-Webhook-Token`; callbacks are unauthenticated when unset
    pub webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, webhook_secret: Option<String>) -> Self {
        Self {
            webhooks: orchestrator.webhook_handler(),
            jobs: orchestrator.jobs(),
            orchestrator,
            webhook_secret,
        }
    }
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Training endpoints
        .route("/training", post(training::launch_training))
        .route("/training/{id}", get(training::get_training))
        // Provider callbacks
        .route("/webhook/training", post(webhook::training_callback))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
