//! Core engine. The public API for submitting and tracking jobs.
//!
//! The engine owns a handle to the store and the submission policies. All
//! state transitions go through here; workers and API handlers share one
//! [`Queue`] (or clones of it).

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::dedup::{ContentDigest, DedupPolicy};
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::JobStore;
use crate::telemetry::metrics;

/// Largest accepted payload, measured as serialized JSON.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// The job queue engine.
#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn JobStore>,
    dedup: Arc<dyn DedupPolicy>,
    on_in_flight: InFlightPolicy,
}

impl Queue {
    /// Create an engine over `store` with content-digest dedup and
    /// rejection of resubmissions against in-flight jobs.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            dedup: Arc::new(ContentDigest),
            on_in_flight: InFlightPolicy::default(),
        }
    }

    pub fn with_dedup(mut self, policy: impl DedupPolicy + 'static) -> Self {
        self.dedup = Arc::new(policy);
        self
    }

    pub fn with_in_flight_policy(mut self, policy: InFlightPolicy) -> Self {
        self.on_in_flight = policy;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Submit a job. Collapses into a still-queued duplicate when the
    /// dedup policy derives a matching key.
    pub async fn submit(&self, new: NewJob) -> Result<Submitted> {
        validate_payload(&new.payload)?;
        let key = self.dedup.key_for(&new);

        let result = self
            .store
            .insert_or_replace(new.payload, key, self.on_in_flight)
            .await;

        match &result {
            Ok(submitted) => {
                metrics::jobs_submitted().add(
                    1,
                    &[KeyValue::new("result", submitted.disposition.to_string())],
                );
                info!(
                    job_id = %submitted.job.id,
                    disposition = %submitted.disposition,
                    "job submitted"
                );
            }
            Err(Error::Conflict { existing }) => {
                metrics::jobs_submitted().add(1, &[KeyValue::new("result", "conflict")]);
                warn!(existing = %existing, "resubmission conflicts with in-flight job");
            }
            Err(e) => {
                metrics::jobs_submitted().add(1, &[KeyValue::new("result", "error")]);
                warn!("submit failed: {e}");
            }
        }

        result
    }

    /// Read-only status lookup.
    pub async fn get_status(&self, id: JobId) -> Result<JobReport> {
        self.store.get(id).await.map(JobReport::from)
    }

    /// Get the full job record.
    pub async fn get(&self, id: JobId) -> Result<Job> {
        self.store.get(id).await
    }

    /// List jobs, newest first.
    pub async fn list(&self, status: Option<Status>, limit: usize) -> Result<Vec<Job>> {
        self.store.list(status, limit).await
    }

    /// Store reachability.
    pub async fn health(&self) -> Result<()> {
        self.store.health_check().await
    }

    /// Claim the oldest queued job for `worker_id`. Returns None if the
    /// queue is empty.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        let claimed = self.store.claim(worker_id).await?;
        let result = if claimed.is_some() { "hit" } else { "empty" };
        metrics::claims().add(1, &[KeyValue::new("result", result)]);

        if let Some(ref job) = claimed {
            record_transition(Status::Queued, Status::Processing);
            debug!(job_id = %job.id, worker_id, attempt = job.attempt_count, "job claimed");
        }
        Ok(claimed)
    }

    /// Mark a processing job as completed.
    pub async fn complete(&self, id: JobId) -> Result<Job> {
        self.finish(id, Outcome::Completed).await
    }

    /// Mark a processing job as failed with a diagnostic message.
    pub async fn fail(&self, id: JobId, error: impl Into<String>) -> Result<Job> {
        self.finish(id, Outcome::failed(error)).await
    }

    /// Write the terminal status for a processing job.
    pub async fn finish(&self, id: JobId, outcome: Outcome) -> Result<Job> {
        let job = self.store.finish(id, &outcome).await?;
        record_transition(Status::Processing, job.status);
        Ok(job)
    }
}

fn record_transition(from: Status, to: Status) {
    metrics::state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

/// Payloads must be JSON objects no larger than [`MAX_PAYLOAD_BYTES`].
pub fn validate_payload(payload: &serde_json::Value) -> Result<()> {
    if !payload.is_object() {
        return Err(Error::InvalidPayload(
            "payload must be a JSON object".to_string(),
        ));
    }
    let size = serde_json::to_vec(payload)?.len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(Error::InvalidPayload(format!(
            "payload too large ({size} bytes, max {MAX_PAYLOAD_BYTES})"
        )));
    }
    Ok(())
}
