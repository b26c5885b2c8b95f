//! Job execution span helpers.
//!
//! Provides span creation and state-transition recording for jobs flowing
//! through a worker.

use tracing::Span;

use crate::model::JobId;

/// Start a span for one claimed job.
///
/// The `job.status` field is declared empty and filled by
/// [`record_state_transition`].
pub fn start_job_span(worker_id: &str, job_id: &JobId, attempt: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.id" = %job_id,
        "job.worker" = worker_id,
        "job.attempt" = attempt,
        "job.status" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and emit an `info` event inside it.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
