//! Training launch DTOs

use serde::{Deserialize, Serialize};

/// Request to train a personalized model for a user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchTraining {
    pub owner_id: i64,
    pub model_name: String,
    pub trigger_word: String,
    /// Publicly reachable zip of training images
    pub input_archive_url: String,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
}

impl LaunchTraining {
    /// Checks the request shape before anything is admitted or charged.
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_model_name(&self.model_name) {
            return Err(format!(
                "model name '{}' must be 1-100 lowercase letters, digits, '-', '_' or '.'",
                self.model_name
            ));
        }

        if self.trigger_word.trim().is_empty() {
            return Err("trigger word cannot be empty".to_string());
        }

        if !self.input_archive_url.starts_with("http://")
            && !self.input_archive_url.starts_with("https://")
        {
            return Err("input archive must be an http(s) URL".to_string());
        }

        if self.steps == Some(0) {
            return Err("steps must be greater than 0".to_string());
        }

        Ok(())
    }
}

fn is_valid_model_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 100
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with(['-', '.'])
}
