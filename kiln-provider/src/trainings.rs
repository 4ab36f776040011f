//! Training endpoints

use crate::error::{ProviderError, Result};
use crate::{ProviderClient, Submission};
use kiln_core::dto::provider::{StartTrainingRequest, TrainingInput, TrainingResponse};

impl ProviderClient {
    /// Start a training that publishes into `account/model_name`
    ///
    /// Authenticates with the submitting user's credential, not the service
    /// token, so the training is billed to and owned by that user.
    pub async fn start_job(&self, submission: &Submission) -> Result<TrainingResponse> {
        if submission.credential.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "provider credential is required".to_string(),
            ));
        }

        let webhook_events_filter = if submission.webhook_url.is_some() {
            vec!["completed".to_string()]
        } else {
            Vec::new()
        };

        let body = StartTrainingRequest {
            version: self.trainer_version.clone(),
            destination: submission.destination(),
            input: TrainingInput {
                input_images: submission.input_archive_url.clone(),
                trigger_word: submission.trigger_word.clone(),
                steps: submission.steps,
            },
            webhook: submission.webhook_url.clone(),
            webhook_events_filter,
        };

        let url = format!("{}/v1/trainings", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&submission.credential)
            .header("Idempotency-Key", &submission.idempotency_key)
            .json(&body)
            .send()
            .await?;

        let training: TrainingResponse = self.handle_response(response).await?;

        tracing::info!(
            "Provider accepted training {} for {} (status: {})",
            training.id,
            body.destination,
            training.status
        );

        Ok(training)
    }

    /// Get the current state of a training
    pub async fn get_status(&self, provider_job_id: &str) -> Result<TrainingResponse> {
        let url = format!("{}/v1/trainings/{}", self.base_url, provider_job_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        self.handle_response(response).await
    }
}
