//! Admission cache
//!
//! Short-lived in-process guard against submitting the same (owner, model)
//! twice while a first submission is still in flight, plus a per-user rate
//! limit. Losing its contents never corrupts a job; it only reopens the
//! window for a duplicate submission. The job record stays the source of
//! truth.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Status of an admitted submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct Entry {
    status: EntryStatus,
    inserted_at: Instant,
    provider_job_id: Option<String>,
}

/// Result of an admission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// A submission for the same (owner, model) is still in flight
    Duplicate,
    /// The owner submitted something else too recently
    RateLimited { retry_after: Duration },
}

impl Admission {
    #[cfg(test)]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

type Key = (i64, String);

#[derive(Default)]
struct Inner {
    entries: HashMap<Key, Entry>,
    last_admitted: HashMap<i64, Instant>,
}

/// Mutex-guarded TTL map; every check-then-act runs under one lock
pub struct AdmissionCache {
    ttl: Duration,
    rate_limit: Duration,
    inner: Mutex<Inner>,
}

impl AdmissionCache {
    pub fn new(ttl: Duration, rate_limit: Duration) -> Self {
        Self {
            ttl,
            rate_limit,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Admit a submission unless a live PENDING entry exists for the key or
    /// the owner is rate limited. Sweeps expired entries first.
    pub fn try_admit(&self, owner_id: i64, model_name: &str) -> Admission {
        self.try_admit_at(owner_id, model_name, Instant::now())
    }

    fn try_admit_at(&self, owner_id: i64, model_name: &str, now: Instant) -> Admission {
        let mut inner = self.lock();
        self.sweep(&mut inner, now);

        let key = (owner_id, model_name.to_string());
        if let Some(entry) = inner
            .entries
            .get(&key)
            .filter(|e| e.status == EntryStatus::Pending)
        {
            tracing::debug!(
                "Duplicate submission for user {} model {} (provider job: {:?})",
                owner_id,
                model_name,
                entry.provider_job_id
            );
            return Admission::Duplicate;
        }

        if let Some(last) = inner.last_admitted.get(&owner_id) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.rate_limit {
                return Admission::RateLimited {
                    retry_after: self.rate_limit - elapsed,
                };
            }
        }

        inner.entries.insert(
            key,
            Entry {
                status: EntryStatus::Pending,
                inserted_at: now,
                provider_job_id: None,
            },
        );
        inner.last_admitted.insert(owner_id, now);

        Admission::Admitted
    }

    /// Update an existing entry. A missing entry is ignored.
    pub fn mark_status(
        &self,
        owner_id: i64,
        model_name: &str,
        status: EntryStatus,
        provider_job_id: Option<&str>,
    ) {
        let mut inner = self.lock();
        let key = (owner_id, model_name.to_string());

        match inner.entries.get_mut(&key) {
            Some(entry) => {
                entry.status = status;
                if let Some(id) = provider_job_id {
                    entry.provider_job_id = Some(id.to_string());
                }
            }
            None => {
                tracing::debug!(
                    "No admission entry for user {} model {}, skipping status {:?}",
                    owner_id,
                    model_name,
                    status
                );
            }
        }
    }

    /// Number of tracked (owner, model) entries
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self, inner: &mut Inner, now: Instant) {
        let ttl = self.ttl;
        inner
            .entries
            .retain(|_, entry| now.saturating_duration_since(entry.inserted_at) <= ttl);

        let rate_limit = self.rate_limit;
        inner
            .last_admitted
            .retain(|_, at| now.saturating_duration_since(*at) < rate_limit);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The map holds no invariants a panicking holder could break
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
