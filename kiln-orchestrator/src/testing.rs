//! Test fixtures: a scripted provider, a recording notifier and a harness
//! wiring them to in-memory stores.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::domain::job::{JobPatch, TrainingJob};
use kiln_core::domain::provider::{ProviderStatus, TrainingOutput};
use kiln_core::domain::user::User;
use kiln_core::dto::training::LaunchTraining;
use kiln_provider::{ProviderError, Submission, TrainingProvider, TrainingResponse};
use uuid::Uuid;

use crate::repository::memory::{InMemoryJobStore, InMemoryUserStore};
use crate::repository::{JobRecordStore, UserStore};
use crate::service::notify::{NotificationSink, NotifyError};
use crate::service::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::service::poll::PollLoop;
use crate::service::reconcile::Reconciler;
use crate::service::step::RetryPolicy;
use crate::service::webhook::WebhookHandler;

pub fn user(id: i64, balance: i64) -> User {
    User {
        id,
        external_account_name: Some(format!("acct-{id}")),
        provider_credential: Some(format!("r8_user_{id}")),
        balance,
        locale: "en".to_string(),
    }
}

pub fn request(model_name: &str) -> LaunchTraining {
    LaunchTraining {
        owner_id: 1,
        model_name: model_name.to_string(),
        trigger_word: "TOK".to_string(),
        input_archive_url: "https://files.example/images.zip".to_string(),
        steps: None,
        description: None,
    }
}

pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        training_cost: 100,
        default_steps: 1000,
        default_destination: None,
        webhook_url: Some("http://kiln.test/webhook/training".to_string()),
        admission_ttl: Duration::from_secs(300),
        admission_rate_limit: Duration::ZERO,
        poll_interval: Duration::from_millis(5),
        poll_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        },
    }
}

/// Records every delivered notification
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(i64, String)>>,
    attempts: AtomicUsize,
    failing: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every delivery fails
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<(i64, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn send(&self, user_id: i64, text: &str) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(NotifyError::Rejected(503));
        }
        self.messages
            .lock()
            .unwrap()
            .push((user_id, text.to_string()));
        Ok(())
    }
}

/// Provider fake driven by per-job status scripts
///
/// Each status read pops the next scripted response; the last one repeats.
#[derive(Default)]
pub struct ScriptedProvider {
    statuses: Mutex<HashMap<String, VecDeque<TrainingResponse>>>,
    submissions: Mutex<Vec<Submission>>,
    ensure_failure: Mutex<Option<u16>>,
    start_failure: Mutex<Option<u16>>,
    status_failure: Mutex<Option<u16>>,
    ensure_calls: AtomicUsize,
    start_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn script_status(&self, provider_job_id: &str, status: ProviderStatus, output: Option<&str>) {
        self.statuses
            .lock()
            .unwrap()
            .entry(provider_job_id.to_string())
            .or_default()
            .push_back(TrainingResponse {
                id: provider_job_id.to_string(),
                status,
                error: None,
                output: output.map(|o| TrainingOutput::Reference(o.to_string())),
            });
    }

    /// Replace the script with one status returned forever
    pub fn always_status(&self, provider_job_id: &str, status: ProviderStatus) {
        self.statuses.lock().unwrap().remove(provider_job_id);
        self.script_status(provider_job_id, status, None);
    }

    pub fn fail_ensure_with(&self, status: u16) {
        *self.ensure_failure.lock().unwrap() = Some(status);
    }

    pub fn fail_start_with(&self, status: u16) {
        *self.start_failure.lock().unwrap() = Some(status);
    }

    pub fn fail_status_with(&self, status: u16) {
        *self.status_failure.lock().unwrap() = Some(status);
    }

    pub fn ensure_calls(&self) -> usize {
        self.ensure_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn last_submission(&self) -> Option<Submission> {
        self.submissions.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl TrainingProvider for ScriptedProvider {
    async fn ensure_model_exists(
        &self,
        _account: &str,
        _model_name: &str,
        _description: &str,
    ) -> kiln_provider::Result<bool> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        match *self.ensure_failure.lock().unwrap() {
            Some(status) => Err(ProviderError::api_error(status, "model setup refused")),
            None => Ok(true),
        }
    }

    async fn start_job(&self, submission: &Submission) -> kiln_provider::Result<TrainingResponse> {
        let n = self.start_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(status) = *self.start_failure.lock().unwrap() {
            return Err(ProviderError::api_error(status, "training refused"));
        }
        self.submissions.lock().unwrap().push(submission.clone());
        Ok(TrainingResponse {
            id: format!("p{n}"),
            status: ProviderStatus::Starting,
            error: None,
            output: None,
        })
    }

    async fn get_status(&self, provider_job_id: &str) -> kiln_provider::Result<TrainingResponse> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.status_failure.lock().unwrap() {
            return Err(ProviderError::api_error(status, "unavailable"));
        }

        let mut statuses = self.statuses.lock().unwrap();
        let script = statuses
            .get_mut(provider_job_id)
            .ok_or_else(|| ProviderError::api_error(404, "training not found"))?;
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        next.ok_or_else(|| ProviderError::api_error(404, "training not found"))
    }
}

/// Orchestrator over in-memory stores, the scripted provider and a
/// recording notifier. User 1 exists with the given balance.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub reconciler: Arc<Reconciler>,
    pub jobs: Arc<InMemoryJobStore>,
    pub users: Arc<InMemoryUserStore>,
    pub provider: Arc<ScriptedProvider>,
    pub notifier: Arc<RecordingNotifier>,
    cost: i64,
}

impl Harness {
    pub fn new(balance: i64) -> Self {
        Self::with_settings(balance, fast_settings())
    }

    pub fn with_rate_limit(balance: i64, rate_limit: Duration) -> Self {
        let mut settings = fast_settings();
        settings.admission_rate_limit = rate_limit;
        Self::with_settings(balance, settings)
    }

    pub fn with_settings(balance: i64, settings: OrchestratorSettings) -> Self {
        let jobs = Arc::new(InMemoryJobStore::new());
        let users = Arc::new(InMemoryUserStore::with_users([user(1, balance)]));
        let provider = Arc::new(ScriptedProvider::default());
        let notifier = Arc::new(RecordingNotifier::new());
        let cost = settings.training_cost;

        let orchestrator = Arc::new(Orchestrator::new(
            settings,
            users.clone(),
            jobs.clone(),
            provider.clone(),
            notifier.clone(),
        ));

        Self {
            reconciler: orchestrator.reconciler(),
            orchestrator,
            jobs,
            users,
            provider,
            notifier,
            cost,
        }
    }

    pub fn poller(&self) -> &PollLoop {
        self.orchestrator.poller()
    }

    pub fn webhooks(&self) -> Arc<WebhookHandler> {
        self.orchestrator.webhook_handler()
    }

    /// A reserved PENDING job for user 1, as left by an interrupted launch
    pub async fn pending_job(&self) -> TrainingJob {
        assert!(self.users.debit_if_sufficient(1, self.cost).await.unwrap());
        let job = TrainingJob::pending(1, format!("m-{}", Uuid::new_v4()), "TOK", self.cost);
        self.jobs.create(&job).await.unwrap();
        job
    }

    /// A reserved job for user 1 already submitted as `provider_job_id`
    pub async fn processing_job(&self, provider_job_id: &str) -> TrainingJob {
        let job = self.pending_job().await;
        self.jobs
            .update(job.id, &JobPatch::submitted(provider_job_id))
            .await
            .unwrap()
            .unwrap()
    }

    /// Wait for a background job to reach a terminal status
    pub async fn wait_terminal(&self, id: Uuid) -> TrainingJob {
        for _ in 0..400 {
            if let Some(job) = self.jobs.get(id).filter(|j| j.status.is_terminal()) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never reached a terminal status", id);
    }
}
