//! Poll loop
//!
//! Watches one submitted job by reading its provider status on a fixed
//! interval until it is terminal or the deadline passes. Runs next to the
//! webhook handler; both feed the same reconciler.

use std::sync::Arc;
use std::time::Duration;

use kiln_core::domain::job::{JobPatch, JobStatus, TrainingJob};
use kiln_provider::{ProviderError, TrainingProvider};
use tokio::time::Instant;
use uuid::Uuid;

use crate::repository::JobRecordStore;
use crate::service::reconcile::{ReconcileOutcome, Reconciler};
use crate::service::step::{RetryPolicy, run_step};

/// Error recorded when a job outlives the polling deadline
pub const POLLING_TIMEOUT: &str = "polling timeout";

pub struct PollLoop {
    jobs: Arc<dyn JobRecordStore>,
    provider: Arc<dyn TrainingProvider>,
    reconciler: Arc<Reconciler>,
    interval: Duration,
    retry: RetryPolicy,
}

impl PollLoop {
    pub fn new(
        jobs: Arc<dyn JobRecordStore>,
        provider: Arc<dyn TrainingProvider>,
        reconciler: Arc<Reconciler>,
        interval: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            jobs,
            provider,
            reconciler,
            interval,
            retry,
        }
    }

    /// Poll until the job is terminal or `deadline` passes
    ///
    /// The provider is asked one last time once the deadline has passed, so
    /// a job that finished while nobody was watching is not timed out.
    pub async fn watch(&self, job_id: Uuid, provider_job_id: &str, deadline: Instant) {
        tracing::debug!(
            "Watching job {} (provider job {}) until {:?}",
            job_id,
            provider_job_id,
            deadline
        );

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(self.interval.min(remaining)).await;

            if self.poll_once(job_id, provider_job_id).await {
                return;
            }
        }

        if self.poll_once(job_id, provider_job_id).await {
            return;
        }

        tracing::warn!(
            "Job {} (provider job {}) did not finish before the polling deadline",
            job_id,
            provider_job_id
        );
        self.reconciler
            .settle(
                job_id,
                JobStatus::Failed,
                None,
                Some(POLLING_TIMEOUT.to_string()),
            )
            .await;
    }

    /// One status read merged into the job
    ///
    /// # Returns
    /// `true` once the job needs no further polling
    async fn poll_once(&self, job_id: Uuid, provider_job_id: &str) -> bool {
        let job = match self.jobs.get_by_id(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!("Job {} disappeared, stopping poll", job_id);
                return true;
            }
            Err(e) => {
                tracing::warn!("Could not load job {} for polling: {}", job_id, e);
                return false;
            }
        };

        if job.status.is_terminal() {
            tracing::debug!("Job {} already {}, stopping poll", job_id, job.status);
            return true;
        }

        let job = if job.provider_job_id.is_none() {
            self.record_provider_job(job, provider_job_id).await
        } else {
            job
        };

        let training = match run_step(
            &self.retry,
            "get_status",
            ProviderError::is_transient,
            || self.provider.get_status(provider_job_id),
        )
        .await
        {
            Ok(training) => training,
            Err(e) => {
                tracing::error!(
                    "Status check for job {} (provider job {}) failed: {}",
                    job_id,
                    provider_job_id,
                    e
                );
                self.reconciler
                    .settle(
                        job_id,
                        JobStatus::Failed,
                        None,
                        Some(format!("status check failed: {}", e)),
                    )
                    .await;
                return true;
            }
        };

        let Some(observed) = training.status.to_job_status() else {
            tracing::warn!(
                "Provider job {} reported unknown status '{}', ignoring",
                provider_job_id,
                training.status
            );
            return false;
        };

        if observed == job.status {
            return false;
        }

        let result_ref = training
            .output
            .as_ref()
            .and_then(|o| o.reference())
            .map(str::to_string);

        let outcome = self
            .reconciler
            .settle(job_id, observed, result_ref, training.error)
            .await;

        observed.is_terminal() || matches!(outcome, Some(ReconcileOutcome::AlreadyTerminal(_)))
    }

    /// Store the provider id on a job whose submission write was lost
    ///
    /// Retried on every tick until it sticks; webhooks and restarts can only
    /// find the job through this id.
    async fn record_provider_job(&self, job: TrainingJob, provider_job_id: &str) -> TrainingJob {
        let patch = if job.status == JobStatus::Pending {
            JobPatch::submitted(provider_job_id)
        } else {
            JobPatch::provider_job(provider_job_id)
        };

        match self.jobs.update(job.id, &patch).await {
            Ok(Some(updated)) => {
                tracing::info!(
                    "Recorded provider job {} for job {}",
                    provider_job_id,
                    job.id
                );
                updated
            }
            Ok(None) => job,
            Err(e) => {
                tracing::warn!(
                    "Still could not record provider job {} for job {}: {}",
                    provider_job_id,
                    job.id,
                    e
                );
                job
            }
        }
    }
}
