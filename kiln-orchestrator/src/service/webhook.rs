//! Webhook handler
//!
//! Applies provider completion callbacks. Callbacks may arrive at any time
//! after submission and in any order relative to the poll loop.

use std::sync::Arc;

use kiln_core::domain::job::JobStatus;
use kiln_core::dto::webhook::WebhookPayload;
use kiln_provider::{ProviderError, TrainingProvider};

use crate::repository::{JobRecordStore, StoreError};
use crate::service::reconcile::{ReconcileOutcome, Reconciler};
use crate::service::step::{RetryPolicy, run_step};

/// What a callback led to
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Applied(ReconcileOutcome),
    /// Status outside the provider vocabulary; nothing changed
    UnknownStatus(String),
    /// No job carries the callback's provider job id
    UnknownJob,
}

impl WebhookOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, WebhookOutcome::Applied(_))
    }
}

pub struct WebhookHandler {
    jobs: Arc<dyn JobRecordStore>,
    provider: Arc<dyn TrainingProvider>,
    reconciler: Arc<Reconciler>,
    retry: RetryPolicy,
}

impl WebhookHandler {
    pub fn new(
        jobs: Arc<dyn JobRecordStore>,
        provider: Arc<dyn TrainingProvider>,
        reconciler: Arc<Reconciler>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            jobs,
            provider,
            reconciler,
            retry,
        }
    }

    pub async fn handle(&self, payload: WebhookPayload) -> Result<WebhookOutcome, StoreError> {
        let Some(status) = payload.status.to_job_status() else {
            tracing::warn!(
                "Callback for provider job {} has unknown status '{}', ignoring",
                payload.job_id,
                payload.status
            );
            return Ok(WebhookOutcome::UnknownStatus(payload.status.to_string()));
        };

        let Some(job) = self.jobs.get_by_provider_job_id(&payload.job_id).await? else {
            tracing::warn!("Callback for unknown provider job {}", payload.job_id);
            return Ok(WebhookOutcome::UnknownJob);
        };

        if job.status.is_terminal() {
            tracing::debug!(
                "Callback for job {} after it was already {}",
                job.id,
                job.status
            );
            return Ok(WebhookOutcome::Applied(ReconcileOutcome::AlreadyTerminal(
                job.status,
            )));
        }

        let mut result_ref = payload
            .output
            .as_ref()
            .and_then(|o| o.reference())
            .map(str::to_string);

        if status == JobStatus::Succeeded && result_ref.is_none() {
            result_ref = self.fetch_result(&payload.job_id).await;
        }

        let outcome = self
            .reconciler
            .reconcile(job.id, status, result_ref, payload.error)
            .await?;

        Ok(WebhookOutcome::Applied(outcome))
    }

    async fn fetch_result(&self, provider_job_id: &str) -> Option<String> {
        match run_step(
            &self.retry,
            "fetch_result",
            ProviderError::is_transient,
            || self.provider.fetch_result(provider_job_id),
        )
        .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    "Could not fetch result of provider job {}: {}",
                    provider_job_id,
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use kiln_core::domain::provider::{ProviderStatus, TrainingOutput};

    fn payload(job_id: &str, status: &str, output: Option<&str>) -> WebhookPayload {
        WebhookPayload {
            job_id: job_id.to_string(),
            status: ProviderStatus::from(status),
            output: output.map(|o| TrainingOutput::Reference(o.to_string())),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_succeeded_callback_completes_job() {
        let h = Harness::new(200);
        let job = h.processing_job("p1").await;

        let outcome = h
            .webhooks()
            .handle(payload("p1", "succeeded", Some("v2")))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            WebhookOutcome::Applied(ReconcileOutcome::Won(_))
        ));
        let stored = h.jobs.get(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.result_url.as_deref(), Some("v2"));
        assert_eq!(h.provider.status_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_status_changes_nothing() {
        let h = Harness::new(200);
        let job = h.processing_job("p1").await;

        let outcome = h
            .webhooks()
            .handle(payload("p1", "exploded", None))
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::UnknownStatus("exploded".into()));
        assert!(!outcome.is_accepted());
        assert_eq!(h.jobs.get(job.id).unwrap().status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_unknown_job_is_ignored() {
        let h = Harness::new(200);
        let outcome = h
            .webhooks()
            .handle(payload("nope", "succeeded", Some("v2")))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::UnknownJob);
        assert!(h.notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn test_missing_output_is_fetched() {
        let h = Harness::new(200);
        let job = h.processing_job("p1").await;
        h.provider
            .script_status("p1", ProviderStatus::Succeeded, Some("https://cdn.example/w.tar"));

        h.webhooks()
            .handle(payload("p1", "succeeded", None))
            .await
            .unwrap();

        let stored = h.jobs.get(job.id).unwrap();
        assert_eq!(stored.result_url.as_deref(), Some("https://cdn.example/w.tar"));
        assert_eq!(h.provider.status_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_callback_refunds_once() {
        let h = Harness::new(200);
        let job = h.processing_job("p1").await;

        let mut failed = payload("p1", "failed", None);
        failed.error = Some("CUDA out of memory".into());
        h.webhooks().handle(failed.clone()).await.unwrap();
        h.webhooks().handle(failed).await.unwrap();

        let stored = h.jobs.get(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(h.users.credits(), 1);
        assert_eq!(h.users.balance(1), Some(200));

        let messages = h.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].1.contains("CUDA"));
    }

    #[tokio::test]
    async fn test_canceled_callback_refunds() {
        let h = Harness::new(200);
        let job = h.processing_job("p1").await;

        h.webhooks()
            .handle(payload("p1", "cancelled", None))
            .await
            .unwrap();

        assert_eq!(h.jobs.get(job.id).unwrap().status, JobStatus::Canceled);
        assert_eq!(h.users.balance(1), Some(200));
    }
}
