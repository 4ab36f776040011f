//! Training Orchestrator
//!
//! Runs one training job from admission to a terminal state:
//!
//! 1. admission (duplicate and rate-limit guard)
//! 2. payment reservation (validation plus guarded debit)
//! 3. job record creation (PENDING)
//! 4. destination model setup and submission (PROCESSING)
//! 5. completion through the poll loop and the webhook handler
//!
//! Every external call runs as a retried step. A step that still fails ends
//! the job as FAILED through the reconciler, which owns the refund and the
//! notification.

use std::sync::Arc;
use std::time::Duration;

use kiln_core::domain::job::{JobPatch, JobStatus, TrainingJob};
use kiln_core::dto::training::LaunchTraining;
use kiln_provider::{ProviderError, Submission, TrainingProvider};
use thiserror::Error;
use tokio::time::Instant;

use crate::repository::{JobRecordStore, StoreError, UserStore};
use crate::service::admission::{Admission, AdmissionCache, EntryStatus};
use crate::service::messages;
use crate::service::notify::{NotificationSink, notify};
use crate::service::payment::{PaymentError, PaymentReservation, PreparedContext, ValidationError};
use crate::service::poll::PollLoop;
use crate::service::reconcile::Reconciler;
use crate::service::step::{RetryPolicy, always, run_step};
use crate::service::webhook::WebhookHandler;

/// Error recorded for jobs found PENDING after a restart
pub const INTERRUPTED_BEFORE_SUBMISSION: &str = "interrupted before submission";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Amount reserved per training
    pub training_cost: i64,
    /// Steps used when the request leaves them out
    pub default_steps: u32,
    /// Destination account for users without one
    pub default_destination: Option<String>,
    /// Callback URL handed to the provider
    pub webhook_url: Option<String>,
    pub admission_ttl: Duration,
    pub admission_rate_limit: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A reserved and persisted job, ready to be driven
#[derive(Debug, Clone)]
pub struct Launch {
    pub job: TrainingJob,
    pub context: PreparedContext,
    pub request: LaunchTraining,
}

/// Result of a launch attempt
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchOutcome<T = TrainingJob> {
    Accepted(T),
    /// Same (owner, model) already in flight; nothing happened
    Duplicate,
    RateLimited { retry_after: Duration },
    /// Validation failed before any debit
    Rejected(ValidationError),
    /// The guarded debit did not apply
    PaymentDeclined,
}

impl<T> LaunchOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> LaunchOutcome<U> {
        match self {
            LaunchOutcome::Accepted(t) => LaunchOutcome::Accepted(f(t)),
            LaunchOutcome::Duplicate => LaunchOutcome::Duplicate,
            LaunchOutcome::RateLimited { retry_after } => {
                LaunchOutcome::RateLimited { retry_after }
            }
            LaunchOutcome::Rejected(e) => LaunchOutcome::Rejected(e),
            LaunchOutcome::PaymentDeclined => LaunchOutcome::PaymentDeclined,
        }
    }
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    jobs: Arc<dyn JobRecordStore>,
    payments: Arc<PaymentReservation>,
    provider: Arc<dyn TrainingProvider>,
    notifier: Arc<dyn NotificationSink>,
    admission: Arc<AdmissionCache>,
    reconciler: Arc<Reconciler>,
    poller: PollLoop,
    webhooks: Arc<WebhookHandler>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        users: Arc<dyn UserStore>,
        jobs: Arc<dyn JobRecordStore>,
        provider: Arc<dyn TrainingProvider>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let payments = Arc::new(PaymentReservation::new(
            users,
            settings.default_destination.clone(),
        ));
        let admission = Arc::new(AdmissionCache::new(
            settings.admission_ttl,
            settings.admission_rate_limit,
        ));
        let reconciler = Arc::new(Reconciler::new(
            jobs.clone(),
            payments.clone(),
            notifier.clone(),
            admission.clone(),
            settings.retry.clone(),
        ));
        let poller = PollLoop::new(
            jobs.clone(),
            provider.clone(),
            reconciler.clone(),
            settings.poll_interval,
            settings.retry.clone(),
        );
        let webhooks = Arc::new(WebhookHandler::new(
            jobs.clone(),
            provider.clone(),
            reconciler.clone(),
            settings.retry.clone(),
        ));

        Self {
            settings,
            jobs,
            payments,
            provider,
            notifier,
            admission,
            reconciler,
            poller,
            webhooks,
        }
    }

    pub fn jobs(&self) -> Arc<dyn JobRecordStore> {
        self.jobs.clone()
    }

    pub fn webhook_handler(&self) -> Arc<WebhookHandler> {
        self.webhooks.clone()
    }

    #[cfg(test)]
    pub fn reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }

    #[cfg(test)]
    pub fn poller(&self) -> &PollLoop {
        &self.poller
    }

    /// Launch and drive a training in the background
    ///
    /// Returns as soon as the job is persisted; submission and completion
    /// continue on a spawned task.
    pub async fn submit(
        self: &Arc<Self>,
        request: LaunchTraining,
    ) -> Result<LaunchOutcome, OrchestratorError> {
        let outcome = self.launch(request).await?;

        Ok(outcome.map(|launch| {
            let job = launch.job.clone();
            let this = Arc::clone(self);
            tokio::spawn(async move { this.drive(launch).await });
            job
        }))
    }

    /// Admit, reserve and persist a training job
    pub async fn launch(
        &self,
        request: LaunchTraining,
    ) -> Result<LaunchOutcome<Launch>, OrchestratorError> {
        request
            .validate()
            .map_err(OrchestratorError::InvalidRequest)?;

        let owner_id = request.owner_id;
        let model_name = request.model_name.clone();

        match self.admission.try_admit(owner_id, &model_name) {
            Admission::Admitted => {}
            Admission::Duplicate => {
                tracing::info!(
                    "Duplicate launch for user {} model {}, ignoring",
                    owner_id,
                    model_name
                );
                return Ok(LaunchOutcome::Duplicate);
            }
            Admission::RateLimited { retry_after } => {
                tracing::info!(
                    "User {} rate limited for another {:?}",
                    owner_id,
                    retry_after
                );
                return Ok(LaunchOutcome::RateLimited { retry_after });
            }
        }

        let context = match self
            .payments
            .prepare(owner_id, self.settings.training_cost)
            .await
        {
            Ok(context) => context,
            Err(e) => {
                self.admission
                    .mark_status(owner_id, &model_name, EntryStatus::Failed, None);
                return match e {
                    PaymentError::Validation(reason) => {
                        tracing::info!("Launch for user {} rejected: {}", owner_id, reason);
                        notify(
                            self.notifier.as_ref(),
                            owner_id,
                            &messages::validation_rejected(&reason),
                        )
                        .await;
                        Ok(LaunchOutcome::Rejected(reason))
                    }
                    PaymentError::PaymentFailed(_) => {
                        notify(self.notifier.as_ref(), owner_id, &messages::payment_failed())
                            .await;
                        Ok(LaunchOutcome::PaymentDeclined)
                    }
                    PaymentError::Store(e) => Err(e.into()),
                };
            }
        };

        let job = TrainingJob::pending(
            owner_id,
            &model_name,
            &request.trigger_word,
            context.cost,
        );

        if let Err(e) = run_step(&self.settings.retry, "create_job", always, || {
            self.jobs.create(&job)
        })
        .await
        {
            tracing::error!(
                "Could not persist job for user {} model {}: {}",
                owner_id,
                model_name,
                e
            );
            self.admission
                .mark_status(owner_id, &model_name, EntryStatus::Failed, None);
            let refunded = self.refund_unrecorded(&context).await;
            notify(
                self.notifier.as_ref(),
                owner_id,
                &messages::training_failed(&model_name, refunded),
            )
            .await;
            return Err(e.into());
        }

        tracing::info!(
            "Job {} created for user {} model {} (reserved {})",
            job.id,
            owner_id,
            model_name,
            context.cost
        );

        Ok(LaunchOutcome::Accepted(Launch {
            job,
            context,
            request,
        }))
    }

    /// Submit a launched job and watch it until it is terminal
    pub async fn drive(&self, launch: Launch) {
        let Launch {
            job,
            context,
            request,
        } = launch;

        let description = request
            .description
            .clone()
            .unwrap_or_else(|| format!("Personalized model {}", job.model_name));

        if let Err(e) = run_step(
            &self.settings.retry,
            "ensure_model_exists",
            ProviderError::is_transient,
            || {
                self.provider
                    .ensure_model_exists(&context.account, &job.model_name, &description)
            },
        )
        .await
        {
            tracing::error!(
                "Model setup for job {} ({}/{}) failed: {}",
                job.id,
                context.account,
                job.model_name,
                e
            );
            self.fail(&job, format!("model setup failed: {}", e)).await;
            return;
        }

        let submission = Submission {
            account: context.account.clone(),
            model_name: job.model_name.clone(),
            input_archive_url: request.input_archive_url.clone(),
            trigger_word: job.trigger_word.clone(),
            steps: request.steps.unwrap_or(self.settings.default_steps),
            credential: context.credential.clone(),
            webhook_url: self.settings.webhook_url.clone(),
            idempotency_key: job.id.to_string(),
        };

        let training = match run_step(
            &self.settings.retry,
            "start_job",
            ProviderError::is_safe_to_resubmit,
            || self.provider.start_job(&submission),
        )
        .await
        {
            Ok(training) => training,
            Err(e) => {
                if e.is_ambiguous() {
                    tracing::error!(
                        "Submission of job {} timed out and may exist on the provider \
                         (idempotency key {}); check {} manually",
                        job.id,
                        submission.idempotency_key,
                        submission.destination()
                    );
                } else {
                    tracing::error!("Submission of job {} failed: {}", job.id, e);
                }
                self.fail(&job, format!("submission failed: {}", e)).await;
                return;
            }
        };

        let submitted = JobPatch::submitted(&training.id);
        match run_step(&self.settings.retry, "record_submission", always, || {
            self.jobs.update(job.id, &submitted)
        })
        .await
        {
            Ok(Some(_)) => {
                self.admission.mark_status(
                    job.owner_id,
                    &job.model_name,
                    EntryStatus::Pending,
                    Some(&training.id),
                );
                tracing::info!(
                    "Job {} submitted as provider job {} ({})",
                    job.id,
                    training.id,
                    training.status
                );
            }
            Ok(None) => {
                tracing::warn!(
                    "Job {} moved before its submission was recorded",
                    job.id
                );
                return;
            }
            Err(e) => {
                tracing::error!(
                    "Provider job {} for job {} could not be recorded yet, the poll loop keeps trying: {}",
                    training.id,
                    job.id,
                    e
                );
            }
        }

        self.poller
            .watch(
                job.id,
                &training.id,
                Instant::now() + self.settings.poll_timeout,
            )
            .await;
    }

    /// Pick up jobs left in flight by a previous process
    ///
    /// PROCESSING jobs get a new poll loop with what is left of their
    /// deadline. PENDING jobs never reached the provider and are failed and
    /// refunded. A PROCESSING job without a provider id may still be running
    /// remotely, so it is left alone for an operator.
    pub async fn resume_in_flight(self: &Arc<Self>) -> Result<usize, StoreError> {
        let active = self.jobs.list_active().await?;
        let mut resumed = 0;

        for job in active {
            match (job.status, job.provider_job_id.clone()) {
                (JobStatus::Processing, Some(provider_job_id)) => {
                    let elapsed = (chrono::Utc::now() - job.updated_at)
                        .to_std()
                        .unwrap_or_default();
                    let remaining = self.settings.poll_timeout.saturating_sub(elapsed);
                    tracing::info!(
                        "Resuming watch of job {} (provider job {}), {:?} left",
                        job.id,
                        provider_job_id,
                        remaining
                    );

                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        this.poller
                            .watch(job.id, &provider_job_id, Instant::now() + remaining)
                            .await
                    });
                    resumed += 1;
                }
                (JobStatus::Processing, None) => {
                    tracing::error!(
                        "Job {} (user {}, model {}) is PROCESSING without a provider job; \
                         look it up on the provider by idempotency key {} and settle it manually",
                        job.id,
                        job.owner_id,
                        job.model_name,
                        job.id
                    );
                }
                _ => {
                    tracing::warn!(
                        "Job {} was {} without a provider job at startup, failing it",
                        job.id,
                        job.status
                    );
                    self.fail(&job, INTERRUPTED_BEFORE_SUBMISSION.to_string())
                        .await;
                }
            }
        }

        Ok(resumed)
    }

    async fn fail(&self, job: &TrainingJob, error: String) {
        self.reconciler
            .settle(job.id, JobStatus::Failed, None, Some(error))
            .await;
    }

    /// Refund for a debit that never got a job record
    async fn refund_unrecorded(&self, context: &PreparedContext) -> Option<i64> {
        let owner_id = context.user.id;
        match run_step(&self.settings.retry, "refund", StoreError::never_sent, || {
            self.payments.refund(owner_id, context.cost)
        })
        .await
        {
            Ok(true) if context.cost > 0 => Some(context.cost),
            Ok(_) => None,
            Err(e) => {
                tracing::error!(
                    "Refund of {} to user {} failed, needs manual credit: {}",
                    context.cost,
                    owner_id,
                    e
                );
                None
            }
        }
    }
}
