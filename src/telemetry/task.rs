//! Task execution span helpers.

use opentelemetry::KeyValue;
use tracing::Span;

use crate::model::{State, TaskId};
use crate::telemetry::metrics;

/// Start a span for one delivery of a task.
///
/// The `task.state` field is declared empty and updated by
/// [`record_state_transition`].
pub fn start_task_span(name: &str, id: &TaskId, queue: &str, retries: u32) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.name" = name,
        "task.id" = %id,
        "task.queue" = queue,
        "task.retries" = retries,
        "task.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and count it.
pub fn record_state_transition(span: &Span, from: State, to: State) {
    span.record("task.state", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
    metrics::task_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}
