//! Core data model.
//!
//! A job is a JSON payload waiting to be executed once. It moves along
//! `queued -> processing -> completed | failed` and never back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned by the store.
    pub id: JobId,

    /// Arbitrary parameters for the handler. The engine doesn't interpret these.
    pub payload: serde_json::Value,

    /// De-duplication key derived at submission. None means no dedup.
    pub dedup_key: Option<String>,

    /// Current lifecycle state.
    pub status: Status,

    /// Worker currently (or last) holding the job. Set once, on claim.
    pub worker_id: Option<String>,

    /// Number of successful claims.
    pub attempt_count: u32,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Diagnostic message recorded on failure.
    pub last_error: Option<String>,
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters, for tabular output.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| Error::Other(format!("invalid job id '{s}': {e}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for a worker.
    Queued,
    /// Claimed by a worker and executing.
    Processing,
    /// Done successfully. Terminal.
    Completed,
    /// Execution failed. Terminal; there is no retry.
    Failed,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Queued, Processing) | (Processing, Completed) | (Processing, Failed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Status::Queued),
            "processing" => Ok(Status::Processing),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            other => Err(Error::Other(format!("unknown job status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of executing a job, written back by the worker that claimed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed { error: String },
}

impl Outcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Outcome::Failed {
            error: error.into(),
        }
    }

    /// The terminal status this outcome produces.
    pub fn status(&self) -> Status {
        match self {
            Outcome::Completed => Status::Completed,
            Outcome::Failed { .. } => Status::Failed,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Outcome::Completed => None,
            Outcome::Failed { error } => Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Builder for new jobs. The engine's public API for submitting work.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) payload: serde_json::Value,
    pub(crate) dedup_key: Option<String>,
}

impl NewJob {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            dedup_key: None,
        }
    }

    /// Caller-supplied idempotency key.
    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn supplied_key(&self) -> Option<&str> {
        self.dedup_key.as_deref()
    }
}

/// What to do when a submission's key matches a job that is already processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InFlightPolicy {
    /// Refuse the submission with [`Error::Conflict`].
    #[default]
    Reject,
    /// Insert an independent queued job alongside the in-flight one.
    Enqueue,
}

/// How a submission landed in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// A new row was inserted.
    Created,
    /// A still-queued duplicate was superseded in place.
    Replaced,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disposition::Created => write!(f, "created"),
            Disposition::Replaced => write!(f, "replaced"),
        }
    }
}

/// Result of a submission: the stored job and how it got there.
#[derive(Debug, Clone)]
pub struct Submitted {
    pub job: Job,
    pub disposition: Disposition,
}

// ---------------------------------------------------------------------------
// Status report
// ---------------------------------------------------------------------------

/// Client-facing view of a job, as returned by a status lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub status: Status,
    pub attempt_count: u32,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<Job> for JobReport {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            attempt_count: job.attempt_count,
            payload: job.payload,
            last_error: job.last_error,
        }
    }
}
