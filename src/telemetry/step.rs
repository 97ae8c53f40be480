//! Step execution span helpers.
//!
//! Provides span creation and state-transition recording for step tasks
//! flowing through the executor.

use tracing::Span;

use crate::model::{RunId, TaskId};

/// Start a span for one step attempt.
///
/// The `step.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_step_span(
    workflow: &str,
    step: &str,
    run_id: RunId,
    task_id: TaskId,
    attempt: u32,
) -> Span {
    tracing::info_span!(
        "step.execute",
        "step.workflow" = workflow,
        "step.id" = step,
        "step.run_id" = %run_id,
        "step.task_id" = %task_id,
        "step.attempt" = attempt,
        "step.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
///
/// Emits a tracing `info` event scoped to the span and updates its
/// `step.state` field.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("step.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
