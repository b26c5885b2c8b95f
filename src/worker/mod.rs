//! Worker loop: claim a job, execute it, record the outcome, repeat.
//!
//! Each [`Worker`] cycles Idle → Claiming → Executing → Finalizing. When a
//! claim comes back empty it sleeps for the poll interval; when the store is
//! unreachable it logs, backs off, and tries again. It never exits on its own.
//!
//! Shutdown is cooperative through a [`CancellationToken`] checked at every
//! iteration boundary. A job that has been claimed is always executed and
//! finalized before the worker stops, since nothing else would ever release
//! it.

pub mod handler;
pub mod pool;

pub use handler::{HandlerFn, JobHandler, LogHandler, handler_fn};
pub use pool::WorkerPool;

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::Queue;
use crate::error::Result;
use crate::model::{Job, JobId, Outcome, Status};
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep after an empty claim.
    pub poll_interval: Duration,
    /// Sleep after a store error.
    pub error_backoff: Duration,
    /// Cap on attempts to write a terminal status while the store is
    /// unreachable. None retries until the write lands, which keeps a
    /// finished job from being stranded in `processing`.
    pub finalize_attempts: Option<u32>,
    /// Fail jobs whose handler runs longer than this. None = no limit.
    pub execution_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            finalize_attempts: None,
            execution_timeout: None,
        }
    }
}

impl From<&Config> for WorkerConfig {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            error_backoff: config.error_backoff,
            ..Self::default()
        }
    }
}

/// Counters for one worker's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub completed: u64,
    pub failed: u64,
    pub store_errors: u64,
}

impl WorkerReport {
    /// Jobs this worker claimed and finalized.
    pub fn processed(&self) -> u64 {
        self.completed + self.failed
    }
}

/// What one claim cycle produced.
enum Cycle {
    Processed,
    Empty,
    StoreError,
}

/// A single polling worker.
pub struct Worker {
    id: String,
    queue: Queue,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(queue: Queue, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            queue,
            handler,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Override the worker identity recorded on claimed jobs.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Share a cancellation token (e.g. a pool-wide one).
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request shutdown. The current job, if any, still finishes.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown is requested.
    pub async fn run(&self) -> WorkerReport {
        info!(worker_id = %self.id, "worker started");
        let mut report = WorkerReport::default();

        while !self.shutdown.is_cancelled() {
            match self.cycle(&mut report).await {
                Cycle::Processed => {}
                Cycle::Empty => self.pause(self.config.poll_interval).await,
                Cycle::StoreError => self.pause(self.config.error_backoff).await,
            }
        }

        info!(
            worker_id = %self.id,
            completed = report.completed,
            failed = report.failed,
            "worker stopped"
        );
        report
    }

    /// Claim and execute jobs until a claim comes back empty.
    ///
    /// Unlike [`run`](Self::run), a store error ends the drain and is
    /// returned. Shutdown is still honoured between jobs.
    pub async fn drain(&self) -> Result<WorkerReport> {
        let mut report = WorkerReport::default();
        while !self.shutdown.is_cancelled() {
            let Some(job) = self.queue.claim(&self.id).await? else {
                break;
            };
            self.process(job, &mut report).await;
        }
        Ok(report)
    }

    async fn cycle(&self, report: &mut WorkerReport) -> Cycle {
        match self.queue.claim(&self.id).await {
            Ok(Some(job)) => {
                self.process(job, report).await;
                Cycle::Processed
            }
            Ok(None) => Cycle::Empty,
            Err(e) => {
                report.store_errors += 1;
                metrics::worker_errors().add(1, &[KeyValue::new("stage", "claim")]);
                error!(worker_id = %self.id, transient = e.is_transient(), "claim failed: {e}");
                Cycle::StoreError
            }
        }
    }

    /// Sleep, waking early on shutdown.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    async fn process(&self, job: Job, report: &mut WorkerReport) {
        let span = start_job_span(&self.id, &job.id, job.attempt_count);
        let id = job.id;

        async {
            record_state_transition(&span, "queued", "processing");

            let started = Instant::now();
            let outcome = self.execute(job).await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

            let status = outcome.status();
            metrics::execution_duration_ms()
                .record(elapsed_ms, &[KeyValue::new("status", status.as_str())]);
            match &outcome {
                Outcome::Completed => info!(job_id = %id, elapsed_ms, "job completed"),
                Outcome::Failed { error } => warn!(job_id = %id, elapsed_ms, %error, "job failed"),
            }

            if self.finalize(id, outcome).await {
                record_state_transition(&span, "processing", status.as_str());
                match status {
                    Status::Completed => report.completed += 1,
                    _ => report.failed += 1,
                }
            } else {
                report.store_errors += 1;
            }
        }
        .instrument(span.clone())
        .await
    }

    /// Run the handler in its own task so a panic is contained and
    /// reported as a failure.
    async fn execute(&self, job: Job) -> Outcome {
        let handler = Arc::clone(&self.handler);
        let mut task = tokio::spawn(async move { handler.execute(&job).await });

        let joined = match self.config.execution_timeout {
            None => (&mut task).await,
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Outcome::failed(format!(
                        "execution timed out after {}ms",
                        limit.as_millis()
                    ));
                }
            },
        };

        match joined {
            Ok(Ok(())) => Outcome::Completed,
            Ok(Err(e)) => Outcome::failed(format!("{e:#}")),
            Err(e) if e.is_panic() => Outcome::failed(panic_message(e.into_panic())),
            Err(e) => Outcome::failed(format!("handler task aborted: {e}")),
        }
    }

    /// Write the terminal status, retrying transient store errors with
    /// `error_backoff` between attempts. Returns whether the write landed.
    /// Not interrupted by shutdown.
    async fn finalize(&self, id: JobId, outcome: Outcome) -> bool {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let err = match self.queue.finish(id, outcome.clone()).await {
                Ok(_) => return true,
                Err(e) => e,
            };
            metrics::worker_errors().add(1, &[KeyValue::new("stage", "finalize")]);

            let capped = self
                .config
                .finalize_attempts
                .is_some_and(|max| attempt >= max.max(1));
            if !err.is_transient() || capped {
                error!(job_id = %id, attempt, "failed to record outcome: {err}");
                return false;
            }
            warn!(job_id = %id, attempt, "retrying outcome write: {err}");
            tokio::time::sleep(self.config.error_backoff).await;
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {detail}")
}
