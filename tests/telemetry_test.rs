//! Integration tests for telemetry initialization and span helpers.

use dagq::model::{MetricName, RunId, TaskId};
use dagq::telemetry::{metrics, step};
use opentelemetry::KeyValue;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = dagq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "dagq-test".to_string(),
        log_level: "debug".to_string(),
        instance_id: None,
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = dagq::telemetry::init_telemetry(config);
}

#[test]
fn resource_carries_service_and_instance_identity() {
    use opentelemetry::Key;

    let config = dagq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "dagq".to_string(),
        log_level: "info".to_string(),
        instance_id: Some("worker-ab12cd34".to_string()),
    };
    let resource = config.resource();

    assert_eq!(
        resource.get(&Key::new("service.name")).map(|v| v.to_string()),
        Some("dagq".to_string())
    );
    assert_eq!(
        resource.get(&Key::new("service.instance.id")).map(|v| v.to_string()),
        Some("worker-ab12cd34".to_string())
    );
    assert_eq!(
        resource.get(&Key::new("service.version")).map(|v| v.to_string()),
        Some(env!("CARGO_PKG_VERSION").to_string())
    );
}

#[test]
fn resource_omits_instance_id_when_unset() {
    let config = dagq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "dagq".to_string(),
        log_level: "info".to_string(),
        instance_id: None,
    };
    let resource = config.resource();
    assert!(resource.get(&opentelemetry::Key::new("service.instance.id")).is_none());
}

#[test]
fn step_span_creates_and_records_transition() {
    let span = step::start_step_span("etl", "extract", RunId::new(), TaskId::new(), 1);
    step::record_state_transition(&span, "claimed", "running");
    step::record_state_transition(&span, "running", "completed");
}

#[test]
fn instruments_record_without_a_meter_provider() {
    let labels = [KeyValue::new("workflow", "etl")];
    metrics::runs_submitted().add(1, &labels);
    metrics::run_completions().add(1, &labels);
    metrics::dead_letters().add(1, &[KeyValue::new("queue", "wf_etl_extract")]);
    metrics::operation_duration_ms().record(12.5, &[KeyValue::new("operation", "queue.read")]);
    for metric in [
        MetricName::ExecutionTime,
        MetricName::SuccessRate,
        MetricName::ErrorRate,
        MetricName::Throughput,
    ] {
        metrics::run_metric(metric).record(1.0, &labels);
    }
}
