//! Metric instrument factories for dagq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"dagq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

use crate::model::MetricName;

/// Returns the shared meter for dagq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("dagq")
}

/// Counter: runs submitted.
/// Labels: `workflow`, `version`.
pub fn runs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("dagq.run.submitted")
        .with_description("Number of workflow runs submitted")
        .build()
}

/// Counter: runs reaching a terminal status.
/// Labels: `workflow`, `status` ("completed" | "failed").
pub fn run_completions() -> Counter<u64> {
    meter()
        .u64_counter("dagq.run.completions")
        .with_description("Number of workflow runs finished")
        .build()
}

/// Counter: step task state transitions.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("dagq.task.state_transitions")
        .with_description("Number of step task state transitions")
        .build()
}

/// Counter: handler invocations.
/// Labels: `workflow`, `step`, `outcome` ("ok" | "handler_error" | "timeout" | "fatal").
pub fn step_executions() -> Counter<u64> {
    meter()
        .u64_counter("dagq.step.executions")
        .with_description("Number of step handler invocations")
        .build()
}

/// Counter: messages moved to a dead-letter queue.
/// Labels: `queue`, `reason`.
pub fn dead_letters() -> Counter<u64> {
    meter()
        .u64_counter("dagq.queue.dead_letters")
        .with_description("Number of messages dead-lettered")
        .build()
}

/// Counter: queue-level operations (send, read, archive, delete).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("dagq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("dagq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: messages left on a queue because no handler is bound.
/// Labels: `queue`.
pub fn steps_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("dagq.step.unroutable")
        .with_description("Step messages with no bound handler")
        .build()
}

/// Histogram: a derived run metric, recorded when a run finishes.
/// Labels: `workflow`.
pub fn run_metric(metric: MetricName) -> Histogram<f64> {
    let (name, description, unit) = match metric {
        MetricName::ExecutionTime => (
            "dagq.run.execution_time",
            "Run wall time from submission to completion",
            "ms",
        ),
        MetricName::SuccessRate => (
            "dagq.run.success_rate",
            "Share of step attempts that succeeded",
            "1",
        ),
        MetricName::ErrorRate => (
            "dagq.run.error_rate",
            "Share of step attempts that failed",
            "1",
        ),
        MetricName::Throughput => (
            "dagq.run.throughput",
            "Completed steps per second of run time",
            "{step}/s",
        ),
    };
    meter()
        .f64_histogram(name)
        .with_description(description)
        .with_unit(unit)
        .build()
}
