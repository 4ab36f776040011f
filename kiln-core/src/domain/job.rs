//! Training job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound (in characters) for a persisted job error message.
pub const MAX_ERROR_MESSAGE_LEN: usize = 255;

/// A personalized-model training job
///
/// Created by the orchestrator at submission time and mutated only by the
/// orchestrator and the completion reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJob {
    pub id: Uuid,
    pub owner_id: i64,
    pub model_name: String,
    pub trigger_word: String,
    pub status: JobStatus,
    pub provider_job_id: Option<String>,
    pub cost_reserved: i64,
    pub result_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrainingJob {
    /// Builds a fresh PENDING job for an owner whose payment has been reserved.
    pub fn pending(
        owner_id: i64,
        model_name: impl Into<String>,
        trigger_word: impl Into<String>,
        cost_reserved: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            model_name: model_name.into(),
            trigger_word: trigger_word.into(),
            status: JobStatus::Pending,
            provider_job_id: None,
            cost_reserved,
            result_url: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a patch in memory, mirroring what the store writes.
    pub fn apply(&mut self, patch: &JobPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(id) = &patch.provider_job_id {
            self.provider_job_id = Some(id.clone());
        }
        if let Some(url) = &patch.result_url {
            self.result_url = Some(url.clone());
        }
        if let Some(msg) = &patch.error_message {
            self.error_message = Some(truncate_error(msg));
        }
        self.updated_at = Utc::now();
    }
}

/// Training job lifecycle status
///
/// PENDING -> PROCESSING -> {SUCCEEDED, FAILED, CANCELED}. PENDING may also
/// go straight to FAILED when submission fails. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Statuses from which the job may still move.
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Processing];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether a terminal outcome needs the reserved cost returned.
    pub fn requires_refund(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Canceled)
    }

    /// Whether `next` is a legal forward move from `self`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => next != JobStatus::Pending,
            JobStatus::Processing => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "PROCESSING" => Some(JobStatus::Processing),
            "SUCCEEDED" => Some(JobStatus::Succeeded),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELED" => Some(JobStatus::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partial update for a training job. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub provider_job_id: Option<String>,
    pub result_url: Option<String>,
    pub error_message: Option<String>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// PENDING -> PROCESSING once the provider accepted the job.
    pub fn submitted(provider_job_id: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            provider_job_id: Some(provider_job_id.into()),
            ..Default::default()
        }
    }

    /// Records the provider id without touching the status.
    pub fn provider_job(provider_job_id: impl Into<String>) -> Self {
        Self {
            provider_job_id: Some(provider_job_id.into()),
            ..Default::default()
        }
    }

    /// Terminal write; carries the result on success and the error otherwise.
    pub fn terminal(
        status: JobStatus,
        result_url: Option<String>,
        error_message: Option<String>,
    ) -> Self {
        Self {
            status: Some(status),
            provider_job_id: None,
            result_url,
            error_message: error_message.map(|m| truncate_error(&m)),
        }
    }
}

/// Truncates an error message to [`MAX_ERROR_MESSAGE_LEN`] characters.
pub fn truncate_error(msg: &str) -> String {
    match msg.char_indices().nth(MAX_ERROR_MESSAGE_LEN) {
        Some((idx, _)) => msg[..idx].to_string(),
        None => msg.to_string(),
    }
}
