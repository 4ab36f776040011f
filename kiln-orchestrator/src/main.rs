//! Kiln Orchestrator
//!
//! Runs personalized-model trainings on an external provider on behalf of
//! bot users.
//!
//! Architecture:
//! - Configuration: settings from the environment
//! - Repositories: Postgres job and user stores
//! - Services: admission, payment reservation, submission, completion
//!   watching and reconciliation
//! - API: training launch and status, provider callbacks
//!
//! On startup, jobs left in flight by a previous process are resumed before
//! the API starts accepting requests.

mod api;
mod config;
mod db;
mod repository;
mod service;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use kiln_provider::ProviderClient;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::AppState;
use crate::config::Config;
use crate::repository::{PgJobStore, PgUserStore};
use crate::service::Orchestrator;
use crate::service::notify::{HttpNotifier, LogNotifier, NotificationSink};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_orchestrator=debug,kiln_provider=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Kiln Orchestrator...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    tracing::info!(
        "Loaded configuration: provider_url={}, cost={}, poll_interval={:?}, poll_timeout={:?}",
        config.provider_url,
        config.training_cost,
        config.poll_interval,
        config.poll_timeout
    );

    tracing::info!("Connecting to database...");

    let pool = db::create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;

    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    tracing::info!("Database ready");

    let provider = ProviderClient::new(
        config.provider_url.clone(),
        config.provider_api_token.clone(),
        config.trainer_version.clone(),
    )
    .with_hardware(config.model_hardware.clone());

    let notifier: Arc<dyn NotificationSink> = match &config.notify_url {
        Some(url) => Arc::new(HttpNotifier::new(url.clone())),
        None => {
            tracing::warn!("NOTIFY_URL not set, notifications go to the log only");
            Arc::new(LogNotifier)
        }
    };

    if config.webhook_url().is_none() {
        tracing::warn!("KILN_PUBLIC_URL not set, completion relies on polling only");
    }

    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator_settings(),
        Arc::new(PgUserStore::new(pool.clone())),
        Arc::new(PgJobStore::new(pool)),
        Arc::new(provider),
        notifier,
    ));

    let resumed = orchestrator
        .resume_in_flight()
        .await
        .context("Failed to resume in-flight jobs")?;
    tracing::info!("Resumed {} in-flight job(s)", resumed);

    let app = api::create_router(AppState::new(
        orchestrator,
        config.webhook_secret.clone(),
    ));

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}
