//! Notification sink
//!
//! Delivers a text message to the user's chat. Delivery is best-effort: a
//! failed notification is logged and never fails the job transition that
//! produced it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("notification gateway returned status {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, user_id: i64, text: &str) -> Result<(), NotifyError>;
}

/// Send and swallow failures
pub async fn notify(sink: &dyn NotificationSink, user_id: i64, text: &str) {
    if let Err(e) = sink.send(user_id, text).await {
        tracing::warn!("Failed to notify user {}: {}", user_id, e);
    }
}

/// Posts `{userId, text}` to the bot gateway
pub struct HttpNotifier {
    url: String,
    client: Client,
}

impl HttpNotifier {
    /// Create a notifier with default timeouts
    ///
    /// Delivery is awaited on the job's completion path, so a stuck gateway
    /// must not hold it for longer than the timeout.
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self::with_client(url, client)
    }

    /// Create a notifier around a configured reqwest Client
    pub fn with_client(url: impl Into<String>, client: Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingMessage<'a> {
    user_id: i64,
    text: &'a str,
}

#[async_trait]
impl NotificationSink for HttpNotifier {
    async fn send(&self, user_id: i64, text: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&OutgoingMessage { user_id, text })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }

        Ok(())
    }
}

/// Writes notifications to the log; used when no gateway is configured
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn send(&self, user_id: i64, text: &str) -> Result<(), NotifyError> {
        tracing::info!(user_id = user_id, "Notification: {}", text);
        Ok(())
    }
}
