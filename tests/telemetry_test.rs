//! Integration tests for telemetry initialization and span helpers.

use jobq_rs::model::JobId;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Tracing subscriber can only be set once per process; try_init() in
    // the implementation returns Err instead of panicking if one exists.
    let config = jobq_rs::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "jobq-test".to_string(),
        log_level: "debug".to_string(),
    };
    if let Ok(guard) = jobq_rs::telemetry::init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn job_span_creates_and_records_transition() {
    let id = JobId::new();
    let span = jobq_rs::telemetry::job::start_job_span("worker-1", &id, 1);
    jobq_rs::telemetry::job::record_state_transition(&span, "queued", "processing");
    jobq_rs::telemetry::job::record_state_transition(&span, "processing", "completed");
}

#[test]
fn metric_instruments_record_without_provider() {
    use opentelemetry::KeyValue;
    jobq_rs::telemetry::metrics::jobs_submitted().add(1, &[KeyValue::new("result", "created")]);
    jobq_rs::telemetry::metrics::execution_duration_ms()
        .record(12.5, &[KeyValue::new("status", "completed")]);
}
