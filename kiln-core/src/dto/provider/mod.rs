//! Provider API bodies
//!
//! Request and response shapes of the HTTP training provider.

use serde::{Deserialize, Serialize};

use crate::domain::provider::{ProviderStatus, TrainingOutput};

/// Body for creating a destination model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateModelRequest {
    pub owner: String,
    pub name: String,
    pub description: String,
    pub visibility: String,
    pub hardware: String,
}

/// Body for starting a training
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTrainingRequest {
    /// Trainer version to run
    pub version: String,
    /// `owner/name` of the model that receives the weights
    pub destination: String,
    pub input: TrainingInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub webhook_events_filter: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingInput {
    pub input_images: String,
    pub trigger_word: String,
    pub steps: u32,
}

/// Provider view of a training, returned by start and status calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResponse {
    pub id: String,
    pub status: ProviderStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Option<TrainingOutput>,
}
