//! Provider status vocabulary
//!
//! The training provider reports statuses as free-form strings. They are
//! parsed into [`ProviderStatus`], keeping anything unrecognized in
//! [`ProviderStatus::Unknown`] so callers can log and ignore it.

use serde::{Deserialize, Serialize};

use crate::domain::job::JobStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProviderStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    Unknown(String),
}

impl ProviderStatus {
    /// Only succeeded, failed and canceled end a job on the provider side.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderStatus::Succeeded | ProviderStatus::Failed | ProviderStatus::Canceled
        )
    }

    /// Normalizes onto the job lifecycle. `None` for unknown statuses.
    pub fn to_job_status(&self) -> Option<JobStatus> {
        match self {
            ProviderStatus::Starting | ProviderStatus::Processing => Some(JobStatus::Processing),
            ProviderStatus::Succeeded => Some(JobStatus::Succeeded),
            ProviderStatus::Failed => Some(JobStatus::Failed),
            ProviderStatus::Canceled => Some(JobStatus::Canceled),
            ProviderStatus::Unknown(_) => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ProviderStatus::Starting => "starting",
            ProviderStatus::Processing => "processing",
            ProviderStatus::Succeeded => "succeeded",
            ProviderStatus::Failed => "failed",
            ProviderStatus::Canceled => "canceled",
            ProviderStatus::Unknown(s) => s,
        }
    }
}

impl From<String> for ProviderStatus {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "starting" => ProviderStatus::Starting,
            "processing" => ProviderStatus::Processing,
            "succeeded" => ProviderStatus::Succeeded,
            "failed" => ProviderStatus::Failed,
            "canceled" | "cancelled" => ProviderStatus::Canceled,
            _ => ProviderStatus::Unknown(s),
        }
    }
}

impl From<&str> for ProviderStatus {
    fn from(s: &str) -> Self {
        ProviderStatus::from(s.to_string())
    }
}

impl From<ProviderStatus> for String {
    fn from(status: ProviderStatus) -> Self {
        status.as_str().to_string()
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of a finished training
///
/// Providers return either a bare reference (URL or version id) or an
/// object carrying the published version and the weights URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrainingOutput {
    Reference(String),
    Published {
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        weights: Option<String>,
    },
}

impl TrainingOutput {
    /// The reference handed back to the user: weights URL first, then version.
    pub fn reference(&self) -> Option<&str> {
        match self {
            TrainingOutput::Reference(s) => Some(s.as_str()).filter(|s| !s.is_empty()),
            TrainingOutput::Published { version, weights } => {
                weights.as_deref().or(version.as_deref())
            }
        }
    }
}
