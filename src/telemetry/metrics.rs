//! Metric instrument factories for taskq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"taskq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskq")
}

/// Counter: tasks submitted by clients or the scheduler.
/// Labels: `task`, `queue`.
pub fn tasks_submitted() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.submitted")
        .with_description("Number of tasks submitted")
        .build()
}

/// Counter: task record state transitions.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: queue-level operations (send, read, delete, archive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: handler execution time in milliseconds.
/// Labels: `task`, `outcome` ("success" | "failure" | "retry").
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskq.tasks.duration_ms")
        .with_description("Handler execution time in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: retries scheduled.
/// Labels: `task`.
pub fn task_retries() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.retries")
        .with_description("Number of retries scheduled")
        .build()
}

/// Counter: deliveries naming a task no handler is registered for.
/// Labels: `task`.
pub fn tasks_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.unroutable")
        .with_description("Deliveries with no registered handler")
        .build()
}

/// Counter: broker operations retried after a transport failure.
/// Labels: `operation`.
pub fn broker_reconnects() -> Counter<u64> {
    meter()
        .u64_counter("taskq.broker.reconnects")
        .with_description("Broker operations retried after a transport failure")
        .build()
}

/// Counter: messages published by the periodic scheduler.
/// Labels: `job`.
pub fn scheduler_published() -> Counter<u64> {
    meter()
        .u64_counter("taskq.scheduler.published")
        .with_description("Periodic job messages published")
        .build()
}

/// Counter: control commands sent.
/// Labels: `command`.
pub fn control_commands() -> Counter<u64> {
    meter()
        .u64_counter("taskq.control.commands")
        .with_description("Control commands broadcast")
        .build()
}
