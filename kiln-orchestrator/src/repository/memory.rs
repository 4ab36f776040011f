//! In-memory stores for tests
//!
//! Same guards as the Postgres stores, applied under a mutex so that
//! concurrent callers see the same check-and-write atomicity.

use async_trait::async_trait;
use kiln_core::domain::job::{JobPatch, TrainingJob};
use kiln_core::domain::user::User;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use super::job::allowed_from;
use super::{JobRecordStore, StoreError, UserStore};

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, TrainingJob>>,
    terminal_writes: AtomicUsize,
    failing_provider_writes: AtomicUsize,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes that moved a job into a terminal status
    pub fn terminal_writes(&self) -> usize {
        self.terminal_writes.load(Ordering::SeqCst)
    }

    /// Fail the next `n` updates that carry a provider job id
    pub fn fail_provider_job_writes(&self, n: usize) {
        self.failing_provider_writes.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn get(&self, id: Uuid) -> Option<TrainingJob> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }
}

#[async_trait]
impl JobRecordStore for InMemoryJobStore {
    async fn create(&self, job: &TrainingJob) -> Result<Uuid, StoreError> {
        self.jobs
            .lock()
            .unwrap()
            .entry(job.id)
            .or_insert_with(|| job.clone());
        Ok(job.id)
    }

    async fn update(&self, id: Uuid, patch: &JobPatch) -> Result<Option<TrainingJob>, StoreError> {
        if patch.provider_job_id.is_some() && take_one(&self.failing_provider_writes) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };

        if !allowed_from(patch).contains(&job.status) {
            return Ok(None);
        }

        job.apply(patch);
        if job.status.is_terminal() {
            self.terminal_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Some(job.clone()))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<TrainingJob>, StoreError> {
        Ok(self.get(id))
    }

    async fn get_by_provider_job_id(
        &self,
        provider_job_id: &str,
    ) -> Result<Option<TrainingJob>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .find(|j| j.provider_job_id.as_deref() == Some(provider_job_id))
            .cloned())
    }

    async fn list_active(&self) -> Result<Vec<TrainingJob>, StoreError> {
        let mut active: Vec<TrainingJob> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|j| j.created_at);
        Ok(active)
    }
}

/// Decrement a pending-failure counter; `true` if a failure was due
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
pub struct InMemoryUserStore {
    users: Mutex<HashMap<i64, User>>,
    refunded_jobs: Mutex<HashSet<Uuid>>,
    debits: AtomicUsize,
    credits: AtomicUsize,
    lost_acks: AtomicUsize,
}

impl InMemoryUserStore {
    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let store = Self::default();
        {
            let mut map = store.users.lock().unwrap();
            for user in users {
                map.insert(user.id, user);
            }
        }
        store
    }

    pub fn balance(&self, id: i64) -> Option<i64> {
        self.users.lock().unwrap().get(&id).map(|u| u.balance)
    }

    pub fn debits(&self) -> usize {
        self.debits.load(Ordering::SeqCst)
    }

    pub fn credits(&self) -> usize {
        self.credits.load(Ordering::SeqCst)
    }

    /// The next `n` job credits commit and then report a connection error
    pub fn lose_credit_acks(&self, n: usize) {
        self.lost_acks.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.users.lock().unwrap().get(&id).cloned())
    }

    async fn debit_if_sufficient(&self, id: i64, amount: i64) -> Result<bool, StoreError> {
        let mut users = self.users.lock().unwrap();
        match users.get_mut(&id) {
            Some(user) if user.balance >= amount => {
                user.balance -= amount;
                self.debits.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn credit(&self, id: i64, amount: i64) -> Result<bool, StoreError> {
        let mut users = self.users.lock().unwrap();
        match users.get_mut(&id) {
            Some(user) => {
                user.balance += amount;
                self.credits.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn credit_for_job(
        &self,
        job_id: Uuid,
        user_id: i64,
        amount: i64,
    ) -> Result<bool, StoreError> {
        {
            let mut users = self.users.lock().unwrap();
            let mut refunded = self.refunded_jobs.lock().unwrap();
            if refunded.contains(&job_id) {
                return Ok(true);
            }
            let Some(user) = users.get_mut(&user_id) else {
                return Ok(false);
            };
            user.balance += amount;
            refunded.insert(job_id);
            self.credits.fetch_add(1, Ordering::SeqCst);
        }

        if take_one(&self.lost_acks) {
            return Err(StoreError::Database(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset after commit",
            ))));
        }
        Ok(true)
    }
}
