//! The queue store contract.
//!
//! Every backend offers the same four primitives: insert-or-replace keyed by
//! a de-duplication key, an atomic claim of the oldest queued job, a terminal
//! write keyed by job id, and lookups. All coordination between concurrent
//! workers happens inside these operations; callers hold no locks of their own.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{InFlightPolicy, Job, JobId, Outcome, Status, Submitted};

pub use memory::MemoryStore;

/// Durable substrate for jobs. Shared by the submission path and every worker.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a queued job, or supersede a still-queued job with the same key.
    ///
    /// A processing job with the same key is never mutated: depending on
    /// `on_in_flight` the submission is rejected with a conflict or inserted
    /// as an independent job.
    async fn insert_or_replace(
        &self,
        payload: serde_json::Value,
        dedup_key: Option<String>,
        on_in_flight: InFlightPolicy,
    ) -> Result<Submitted>;

    /// Atomically move the oldest queued job to processing for `worker_id`.
    ///
    /// Concurrent callers never receive the same job. Returns `None` when
    /// nothing is queued.
    async fn claim(&self, worker_id: &str) -> Result<Option<Job>>;

    /// Write the terminal status of a processing job.
    async fn finish(&self, id: JobId, outcome: &Outcome) -> Result<Job>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Job>;

    /// List jobs, newest first, optionally filtered by status.
    async fn list(&self, status: Option<Status>, limit: usize) -> Result<Vec<Job>>;

    /// Reachability probe.
    async fn health_check(&self) -> Result<()>;
}
