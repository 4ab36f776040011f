//! Reconciliation
//!
//! Merges an observed status (from the poll loop, the webhook or the
//! orchestrator's own failure paths) into the job record.
//!
//! Terminal states are sticky. The terminal write is a conditional update
//! that only succeeds from PENDING or PROCESSING, and whichever caller gets
//! the row back owns the refund and the notification. Concurrent observers of
//! the same outcome therefore produce one terminal write, at most one refund
//! and one message. When sources disagree, the first terminal write wins.

use std::sync::Arc;

use kiln_core::domain::job::{JobPatch, JobStatus, TrainingJob};
use uuid::Uuid;

use crate::repository::{JobRecordStore, StoreError};
use crate::service::admission::{AdmissionCache, EntryStatus};
use crate::service::messages;
use crate::service::notify::{NotificationSink, notify};
use crate::service::payment::PaymentReservation;
use crate::service::poll::POLLING_TIMEOUT;
use crate::service::step::{RetryPolicy, always, run_step};

/// What a reconcile call did
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// No job with that id
    NotFound,
    /// The job was already terminal; nothing changed
    AlreadyTerminal(JobStatus),
    /// Observed status equals the persisted one
    Unchanged,
    /// Non-terminal progress was written
    Progressed(JobStatus),
    /// This call performed the terminal transition and its side effects
    Won(TrainingJob),
    /// Another caller moved the job first
    Lost,
}

pub struct Reconciler {
    jobs: Arc<dyn JobRecordStore>,
    payments: Arc<PaymentReservation>,
    notifier: Arc<dyn NotificationSink>,
    admission: Arc<AdmissionCache>,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(
        jobs: Arc<dyn JobRecordStore>,
        payments: Arc<PaymentReservation>,
        notifier: Arc<dyn NotificationSink>,
        admission: Arc<AdmissionCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            jobs,
            payments,
            notifier,
            admission,
            retry,
        }
    }

    pub async fn reconcile(
        &self,
        job_id: Uuid,
        new_status: JobStatus,
        result_ref: Option<String>,
        error_msg: Option<String>,
    ) -> Result<ReconcileOutcome, StoreError> {
        let Some(job) = self.jobs.get_by_id(job_id).await? else {
            tracing::warn!("Reconcile for unknown job {}", job_id);
            return Ok(ReconcileOutcome::NotFound);
        };

        if job.status.is_terminal() {
            tracing::debug!(
                "Job {} already {}, ignoring observed {}",
                job_id,
                job.status,
                new_status
            );
            return Ok(ReconcileOutcome::AlreadyTerminal(job.status));
        }

        if job.status == new_status {
            return Ok(ReconcileOutcome::Unchanged);
        }

        if !new_status.is_terminal() {
            return match self.jobs.update(job_id, &JobPatch::status(new_status)).await? {
                Some(_) => {
                    tracing::info!("Job {} {} -> {}", job_id, job.status, new_status);
                    Ok(ReconcileOutcome::Progressed(new_status))
                }
                None => Ok(ReconcileOutcome::Lost),
            };
        }

        let patch = if new_status == JobStatus::Succeeded {
            JobPatch::terminal(new_status, result_ref, None)
        } else {
            let msg = error_msg.unwrap_or_else(|| format!("training {}", new_status));
            JobPatch::terminal(new_status, None, Some(msg))
        };

        let Some(claimed) = self.jobs.update(job_id, &patch).await? else {
            tracing::debug!("Job {} terminal transition claimed elsewhere", job_id);
            return Ok(ReconcileOutcome::Lost);
        };

        tracing::info!(
            "Job {} {} -> {} (provider job: {:?})",
            job_id,
            job.status,
            claimed.status,
            claimed.provider_job_id
        );

        self.finish(&claimed).await;

        Ok(ReconcileOutcome::Won(claimed))
    }

    /// `reconcile` with store failures retried; exhaustion is logged
    ///
    /// Side effects only run after the claiming write returned a row, so a
    /// failed attempt can be repeated safely.
    pub async fn settle(
        &self,
        job_id: Uuid,
        new_status: JobStatus,
        result_ref: Option<String>,
        error_msg: Option<String>,
    ) -> Option<ReconcileOutcome> {
        let result = run_step(&self.retry, "reconcile", always, || {
            self.reconcile(job_id, new_status, result_ref.clone(), error_msg.clone())
        })
        .await;

        match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(
                    "Could not record {} for job {}, left for resume: {}",
                    new_status,
                    job_id,
                    e
                );
                None
            }
        }
    }

    /// Side effects owned by the winner of the terminal transition
    async fn finish(&self, job: &TrainingJob) {
        let entry_status = if job.status == JobStatus::Succeeded {
            EntryStatus::Completed
        } else {
            EntryStatus::Failed
        };
        self.admission.mark_status(
            job.owner_id,
            &job.model_name,
            entry_status,
            job.provider_job_id.as_deref(),
        );

        let refunded = if job.status.requires_refund() && job.cost_reserved > 0 {
            self.refund(job).await
        } else {
            None
        };

        let text = match job.status {
            JobStatus::Succeeded => {
                messages::training_succeeded(&job.model_name, job.result_url.as_deref())
            }
            JobStatus::Canceled => messages::training_canceled(&job.model_name, refunded),
            _ if job.error_message.as_deref() == Some(POLLING_TIMEOUT) => {
                messages::training_timed_out(&job.model_name, refunded)
            }
            _ => messages::training_failed(&job.model_name, refunded),
        };

        notify(self.notifier.as_ref(), job.owner_id, &text).await;
    }

    async fn refund(&self, job: &TrainingJob) -> Option<i64> {
        let result = run_step(&self.retry, "refund", always, || {
            self.payments.refund_job(job)
        })
        .await;

        match result {
            Ok(true) => Some(job.cost_reserved),
            Ok(false) => None,
            Err(e) => {
                tracing::error!(
                    "Refund of {} for job {} (user {}) failed, needs manual credit: {}",
                    job.cost_reserved,
                    job.id,
                    job.owner_id,
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

    #[tokio::test]
    async fn test_success_notifies_without_refund() {
        let h = Harness::new(200);
        let job = h.processing_job("p1").await;

        let outcome = h
            .reconciler
            .reconcile(job.id, JobStatus::Succeeded, Some("v2".into()), None)
            .await
            .unwrap();

        let ReconcileOutcome::Won(done) = outcome else {
            panic!("expected to win, got {:?}", outcome);
        };
        assert_eq!(done.result_url.as_deref(), Some("v2"));
        assert_eq!(h.users.credits(), 0);
        assert_eq!(h.notifier.messages().len(), 1);
        assert!(h.notifier.messages()[0].1.contains("v2"));
    }

    #[tokio::test]
    async fn test_failure_refunds_exactly_once() {
        let h = Harness::new(200);
        let job = h.processing_job("p1").await;
        assert_eq!(h.users.balance(1), Some(100));

        for _ in 0..5 {
            h.reconciler
                .reconcile(job.id, JobStatus::Failed, None, Some("boom".into()))
                .await
                .unwrap();
        }

        assert_eq!(h.users.credits(), 1);
        assert_eq!(h.users.balance(1), Some(200));
        assert_eq!(h.notifier.messages().len(), 1);
        assert_eq!(h.jobs.terminal_writes(), 1);
    }

    #[tokio::test]
    async fn test_refund_retry_after_lost_ack_credits_once() {
        let h = Harness::new(200);
        let job = h.processing_job("p1").await;
        h.users.lose_credit_acks(1);

        let outcome = h
            .reconciler
            .reconcile(job.id, JobStatus::Failed, None, Some("boom".into()))
            .await
            .unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Won(_)));
        assert_eq!(h.users.credits(), 1);
        assert_eq!(h.users.balance(1), Some(200));
        let messages = h.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains("100 credits"));
    }

    #[tokio::test]
    async fn test_terminal_state_is_sticky() {
        let h = Harness::new(200);
        let job = h.processing_job("p1").await;

        h.reconciler
            .reconcile(job.id, JobStatus::Failed, None, Some("poll said no".into()))
            .await
            .unwrap();

        for status in [
            JobStatus::Succeeded,
            JobStatus::Canceled,
            JobStatus::Processing,
        ] {
            let outcome = h
                .reconciler
                .reconcile(job.id, status, Some("late".into()), None)
                .await
                .unwrap();
            assert_eq!(outcome, ReconcileOutcome::AlreadyTerminal(JobStatus::Failed));
        }

        let stored = h.jobs.get(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.result_url, None);
        assert_eq!(stored.error_message.as_deref(), Some("poll said no"));
    }

    #[tokio::test]
    async fn test_unchanged_and_progress() {
        let h = Harness::new(200);
        let job = h.pending_job().await;

        let outcome = h
            .reconciler
            .reconcile(job.id, JobStatus::Pending, None, None)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged);

        let outcome = h
            .reconciler
            .reconcile(job.id, JobStatus::Processing, None, None)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Progressed(JobStatus::Processing));
        assert!(h.notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let h = Harness::new(200);
        let outcome = h
            .reconciler
            .reconcile(Uuid::new_v4(), JobStatus::Succeeded, None, None)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_error_message_is_truncated() {
        let h = Harness::new(200);
        let job = h.processing_job("p1").await;

        h.reconciler
            .reconcile(job.id, JobStatus::Failed, None, Some("x".repeat(1000)))
            .await
            .unwrap();

        let stored = h.jobs.get(job.id).unwrap();
        assert_eq!(stored.error_message.unwrap().len(), 255);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_success_writes_once() {
        let h = Harness::new(200);
        let job = h.processing_job("p1").await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reconciler = Arc::clone(&h.reconciler);
                tokio::spawn(async move {
                    reconciler
                        .reconcile(job.id, JobStatus::Succeeded, Some("v2".into()), None)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), ReconcileOutcome::Won(_)) {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(h.jobs.terminal_writes(), 1);
        assert_eq!(h.notifier.messages().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_conflicting_terminal_reports_first_wins() {
        let h = Harness::new(200);
        let job = h.processing_job("p1").await;

        let failed = {
            let reconciler = Arc::clone(&h.reconciler);
            tokio::spawn(async move {
                reconciler
                    .reconcile(job.id, JobStatus::Failed, None, Some("poll".into()))
                    .await
                    .unwrap()
            })
        };
        let succeeded = {
            let reconciler = Arc::clone(&h.reconciler);
            tokio::spawn(async move {
                reconciler
                    .reconcile(job.id, JobStatus::Succeeded, Some("v2".into()), None)
                    .await
                    .unwrap()
            })
        };

        let a = failed.await.unwrap();
        let b = succeeded.await.unwrap();
        let winners = [&a, &b]
            .iter()
            .filter(|o| matches!(o, ReconcileOutcome::Won(_)))
            .count();
        assert_eq!(winners, 1);

        let stored = h.jobs.get(job.id).unwrap();
        let expected_credits = usize::from(stored.status == JobStatus::Failed);
        assert_eq!(h.users.credits(), expected_credits);
        assert_eq!(h.notifier.messages().len(), 1);
    }
}
