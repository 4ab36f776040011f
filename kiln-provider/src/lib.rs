//! Kiln Provider Client
//!
//! A type-safe HTTP client for the external model-training provider.
//!
//! The orchestrator talks to the provider only through the [`TrainingProvider`]
//! trait; [`ProviderClient`] is its HTTP implementation.
//!
//! # Example
//!
//! ```no_run
//! use kiln_provider::{ProviderClient, TrainingProvider};
//!
//! #[tokio::main]
//! async fn main() -> kiln_provider::Result<()> {
//!     let client = ProviderClient::new("https://api.replicate.com", "r8_service", "trainer:abc");
//!
//!     let existed = client.ensure_model_exists("alice", "my-face", "Alice's face").await?;
//!     println!("model existed before: {}", existed);
//!     Ok(())
//! }
//! ```

pub mod error;
mod models;
mod trainings;

pub use error::{ProviderError, Result};
pub use kiln_core::dto::provider::TrainingResponse;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Everything needed to start one training on the provider
#[derive(Debug, Clone)]
pub struct Submission {
    /// Destination account (model owner)
    pub account: String,
    pub model_name: String,
    pub input_archive_url: String,
    pub trigger_word: String,
    pub steps: u32,
    /// The user's own provider token
    pub credential: String,
    /// Where the provider should post completion callbacks
    pub webhook_url: Option<String>,
    /// Sent as `Idempotency-Key` so a replayed submission maps to one training
    pub idempotency_key: String,
}

impl Submission {
    /// `account/model_name`, the identifier the weights are published under
    pub fn destination(&self) -> String {
        format!("{}/{}", self.account, self.model_name)
    }
}

/// Gateway to the external training provider
#[async_trait]
pub trait TrainingProvider: Send + Sync {
    /// Makes sure the destination model exists, creating it on "not found"
    ///
    /// # Returns
    /// `true` if the model was already there, `false` if it was just created
    async fn ensure_model_exists(
        &self,
        account: &str,
        model_name: &str,
        description: &str,
    ) -> Result<bool>;

    /// Submits a training job
    async fn start_job(&self, submission: &Submission) -> Result<TrainingResponse>;

    /// Reads the current state of a training
    async fn get_status(&self, provider_job_id: &str) -> Result<TrainingResponse>;

    /// Fetches the output reference of a finished training
    async fn fetch_result(&self, provider_job_id: &str) -> Result<Option<String>> {
        let training = self.get_status(provider_job_id).await?;
        Ok(training
            .output
            .as_ref()
            .and_then(|o| o.reference())
            .map(str::to_string))
    }
}

/// HTTP client for the training provider API
#[derive(Debug, Clone)]
pub struct ProviderClient {
    /// Base URL of the provider (e.g., "https://api.replicate.com")
    base_url: String,
    /// Service token for model management and status reads
    api_token: String,
    /// Trainer version every training runs
    trainer_version: String,
    /// Hardware requested for newly created destination models
    hardware: String,
    client: Client,
}

impl ProviderClient {
    /// Create a new provider client with default timeouts
    pub fn new(
        base_url: impl Into<String>,
        api_token: impl Into<String>,
        trainer_version: impl Into<String>,
    ) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self::with_client(base_url, api_token, trainer_version, client)
    }

    /// Create a provider client around a configured reqwest Client
    pub fn with_client(
        base_url: impl Into<String>,
        api_token: impl Into<String>,
        trainer_version: impl Into<String>,
        client: Client,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.into(),
            trainer_version: trainer_version.into(),
            hardware: "cpu".to_string(),
            client,
        }
    }

    /// Override the hardware used for new destination models
    pub fn with_hardware(mut self, hardware: impl Into<String>) -> Self {
        self.hardware = hardware.into();
        self
    }

    /// Get the base URL of the provider
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status code and deserialize the JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::debug!("Provider returned {}: {}", status, error_text);
            return Err(ProviderError::api_error(status.as_u16(), error_text));
        }

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| ProviderError::ParseError(format!("{}: {}", e, body)))
    }
}

#[async_trait]
impl TrainingProvider for ProviderClient {
    async fn ensure_model_exists(
        &self,
        account: &str,
        model_name: &str,
        description: &str,
    ) -> Result<bool> {
        ProviderClient::ensure_model_exists(self, account, model_name, description).await
    }

    async fn start_job(&self, submission: &Submission) -> Result<TrainingResponse> {
        ProviderClient::start_job(self, submission).await
    }

    async fn get_status(&self, provider_job_id: &str) -> Result<TrainingResponse> {
        ProviderClient::get_status(self, provider_job_id).await
    }
}
