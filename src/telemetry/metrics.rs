//! Metric instrument factories for jobq-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"jobq-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for jobq-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("jobq-rs")
}

/// Counter: submissions.
/// Labels: `result` ("created" | "replaced" | "conflict" | "error").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.submitted")
        .with_description("Number of job submissions")
        .build()
}

/// Counter: claim attempts.
/// Labels: `result` ("hit" | "empty").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("jobq.claims")
        .with_description("Number of claim attempts")
        .build()
}

/// Counter: job state transitions.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Histogram: handler execution time in milliseconds.
/// Labels: `status` ("completed" | "failed").
pub fn execution_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobq.jobs.execution_duration_ms")
        .with_description("Job execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: worker-cycle errors talking to the store.
/// Labels: `stage` ("claim" | "finalize").
pub fn worker_errors() -> Counter<u64> {
    meter()
        .u64_counter("jobq.worker.errors")
        .with_description("Store errors observed by workers")
        .build()
}
