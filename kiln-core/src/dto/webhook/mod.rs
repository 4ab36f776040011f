//! Inbound provider callback DTOs

use serde::{Deserialize, Serialize};

use crate::domain::provider::{ProviderStatus, TrainingOutput};

/// Completion callback posted by the provider
///
/// Accepts both `jobId` and the provider-native `id` for the job handle.
/// Unrecognized statuses land in [`ProviderStatus::Unknown`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    #[serde(alias = "id")]
    pub job_id: String,
    pub status: ProviderStatus,
    #[serde(default)]
    pub output: Option<TrainingOutput>,
    #[serde(default)]
    pub error: Option<String>,
}
