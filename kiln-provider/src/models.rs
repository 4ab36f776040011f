//! Destination model endpoints

use crate::ProviderClient;
use crate::error::{ProviderError, Result};
use kiln_core::dto::provider::CreateModelRequest;

impl ProviderClient {
    /// Make sure `account/model_name` exists on the provider
    ///
    /// A 404 on lookup creates the model. A 409 on creation means someone else
    /// created it in the meantime and is treated as success.
    ///
    /// # Returns
    /// `true` if the model already existed
    pub async fn ensure_model_exists(
        &self,
        account: &str,
        model_name: &str,
        description: &str,
    ) -> Result<bool> {
        if account.is_empty() || model_name.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "account and model name are required".to_string(),
            ));
        }

        let url = format!("{}/v1/models/{}/{}", self.base_url, account, model_name);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!("Model {}/{} already exists", account, model_name);
            return Ok(true);
        }

        if status != reqwest::StatusCode::NOT_FOUND {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::api_error(status.as_u16(), message));
        }

        tracing::info!("Creating destination model {}/{}", account, model_name);

        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&CreateModelRequest {
                owner: account.to_string(),
                name: model_name.to_string(),
                description: description.to_string(),
                visibility: "private".to_string(),
                hardware: self.hardware.clone(),
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(false);
        }

        if status == reqwest::StatusCode::CONFLICT {
            tracing::debug!("Model {}/{} was created concurrently", account, model_name);
            return Ok(true);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(ProviderError::api_error(status.as_u16(), message))
    }
}
