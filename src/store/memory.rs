//! In-process job store.
//!
//! Holds all jobs behind a single mutex. Each trait operation runs as one
//! critical section, which gives the same guarantees as the Postgres backend
//! for workers sharing a process: a claim selects and transitions in one
//! step, so two claimers can never see the same queued job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::{Error, Result};
use crate::model::*;

use super::JobStore;

/// In-memory backend for tests and local development.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    /// Last timestamp handed out; keeps `created_at` strictly increasing.
    clock: Option<DateTime<Utc>>,
}

/// Handle for operations inside one critical section.
///
/// There is no rollback: every operation checks before it writes.
struct TxContext<'a> {
    tables: &'a mut Tables,
}

impl TxContext<'_> {
    fn now(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.tables.clock {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.tables.clock = Some(now);
        now
    }

    fn get(&self, id: JobId) -> Result<&Job> {
        self.tables.jobs.get(&id).ok_or(Error::NotFound(id))
    }

    fn find_by_key(&self, key: &str, status: Status) -> Option<JobId> {
        self.tables
            .jobs
            .values()
            .filter(|j| j.status == status && j.dedup_key.as_deref() == Some(key))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id)
    }

    fn oldest_queued(&self) -> Option<JobId> {
        self.tables
            .jobs
            .values()
            .filter(|j| j.status == Status::Queued)
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id)
    }

    fn insert(&mut self, payload: serde_json::Value, dedup_key: Option<String>) -> Job {
        let job = Job {
            id: JobId::new(),
            payload,
            dedup_key,
            status: Status::Queued,
            worker_id: None,
            attempt_count: 0,
            created_at: self.now(),
            started_at: None,
            completed_at: None,
            last_error: None,
        };
        self.tables.jobs.insert(job.id, job.clone());
        job
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.tables.jobs.get_mut(&id).ok_or(Error::NotFound(id))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the store. While unavailable every
    /// operation fails with [`Error::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Run `f` inside the store's critical section.
    fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TxContext) -> Result<T>,
    {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("memory store offline".to_string()));
        }
        let mut guard = self.lock()?;
        let mut ctx = TxContext {
            tables: &mut *guard,
        };
        f(&mut ctx)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| Error::Other("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_or_replace(
        &self,
        payload: serde_json::Value,
        dedup_key: Option<String>,
        on_in_flight: InFlightPolicy,
    ) -> Result<Submitted> {
        self.with_transaction(|tx| {
            let Some(key) = dedup_key else {
                let job = tx.insert(payload, None);
                return Ok(Submitted {
                    job,
                    disposition: Disposition::Created,
                });
            };

            if let Some(id) = tx.find_by_key(&key, Status::Queued) {
                let now = tx.now();
                let job = tx.job_mut(id)?;
                job.payload = payload;
                job.created_at = now;
                return Ok(Submitted {
                    job: job.clone(),
                    disposition: Disposition::Replaced,
                });
            }

            if on_in_flight == InFlightPolicy::Reject {
                if let Some(existing) = tx.find_by_key(&key, Status::Processing) {
                    return Err(Error::Conflict { existing });
                }
            }

            let job = tx.insert(payload, Some(key));
            Ok(Submitted {
                job,
                disposition: Disposition::Created,
            })
        })
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        self.with_transaction(|tx| {
            let Some(id) = tx.oldest_queued() else {
                return Ok(None);
            };
            let now = tx.now();
            let job = tx.job_mut(id)?;
            job.status = Status::Processing;
            job.worker_id = Some(worker_id.to_string());
            job.started_at = Some(now);
            job.attempt_count += 1;
            Ok(Some(job.clone()))
        })
    }

    async fn finish(&self, id: JobId, outcome: &Outcome) -> Result<Job> {
        self.with_transaction(|tx| {
            let to = outcome.status();
            let from = tx.get(id)?.status;
            if !from.can_transition_to(to) {
                return Err(Error::InvalidTransition { from, to });
            }
            let now = tx.now();
            let job = tx.job_mut(id)?;
            job.status = to;
            job.completed_at = Some(now);
            job.last_error = outcome.error().map(str::to_string);
            Ok(job.clone())
        })
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        self.with_transaction(|tx| tx.get(id).cloned())
    }

    async fn list(&self, status: Option<Status>, limit: usize) -> Result<Vec<Job>> {
        self.with_transaction(|tx| {
            let mut jobs: Vec<Job> = tx
                .tables
                .jobs
                .values()
                .filter(|j| status.is_none_or(|s| j.status == s))
                .cloned()
                .collect();
            jobs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
            jobs.truncate(limit);
            Ok(jobs)
        })
    }

    async fn health_check(&self) -> Result<()> {
        self.with_transaction(|_| Ok(()))
    }
}
