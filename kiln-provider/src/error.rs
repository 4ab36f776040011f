//! Error types for the provider client

use thiserror::Error;

/// Result type alias for provider operations
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur when calling the training provider
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP request failed before a response was read
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Provider returned an error status code
    #[error("provider error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error body returned by the provider
        message: String,
    },

    /// Failed to parse response
    #[error("failed to parse provider response: {0}")]
    ParseError(String),

    /// Request could not be built from the given input
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ApiError { status, .. } => Some(*status),
            Self::RequestFailed(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Check if the provider reported a conflicting (already existing) resource
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    /// Check if this error is a server error (5xx status)
    pub fn is_server_error(&self) -> bool {
        matches!(self.status(), Some(s) if s >= 500)
    }

    /// Worth retrying: network trouble, throttling or a provider-side fault.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed(e) => e.is_connect() || e.is_timeout(),
            Self::ApiError { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// The request may have reached the provider and been acted on.
    ///
    /// A timed-out submission might have created a training, so resubmitting
    /// could start a duplicate.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::RequestFailed(e) if e.is_timeout())
    }

    /// Transient and known not to have been acted on.
    pub fn is_safe_to_resubmit(&self) -> bool {
        self.is_transient() && !self.is_ambiguous()
    }
}
