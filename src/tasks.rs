//! Built-in tasks, registered by `taskq worker` and handy for smoke tests.

use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::context::{Outcome, TaskContext};
use crate::error::Result;
use crate::model::TaskPayload;
use crate::registry::{TaskOptions, TaskRegistry};

/// Register every built-in task.
pub fn register_builtin(registry: &mut TaskRegistry) -> Result<()> {
    registry.register_fn("add_numbers", add_numbers)?;
    registry.register_fn("process_data", process_data)?;
    registry.register_fn("long_running_task", long_running_task)?;
    registry.register_fn_with(
        "task_with_retry",
        TaskOptions::default().max_retries(3),
        task_with_retry,
    )?;
    Ok(())
}

/// `add_numbers(x, y) -> x + y`
pub async fn add_numbers(payload: TaskPayload, _ctx: TaskContext) -> Outcome {
    let (x, y) = match (payload.param::<i64>(0, "x"), payload.param::<i64>(1, "y")) {
        (Ok(x), Ok(y)) => (x, y),
        (Err(e), _) | (_, Err(e)) => return Outcome::failure(e),
    };
    info!(x, y, "adding");
    match x.checked_add(y) {
        Some(sum) => Outcome::success(sum),
        None => Outcome::failure(format!("{x} + {y} overflows")),
    }
}

/// `process_data(data)`: echo the object back with a processing stamp.
pub async fn process_data(payload: TaskPayload, _ctx: TaskContext) -> Outcome {
    let data: Map<String, Value> = match payload.param(0, "data") {
        Ok(data) => data,
        Err(e) => return Outcome::failure(e),
    };
    let delay_ms: u64 = match payload.kwarg_or("delay_ms", 2000) {
        Ok(delay) => delay,
        Err(e) => return Outcome::failure(e),
    };
    info!(keys = data.len(), "processing data");
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

    Outcome::success(json!({
        "status": "processed",
        "original_data": data,
        "processed_at": chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
    }))
}

/// `long_running_task(duration=10)`: one step per second, reporting progress
/// after each. Stops early once the soft time limit passes.
pub async fn long_running_task(payload: TaskPayload, ctx: TaskContext) -> Outcome {
    let duration: u64 = match payload.param_or(0, "duration", 10) {
        Ok(duration) => duration,
        Err(e) => return Outcome::failure(e),
    };
    let step_ms: u64 = match payload.kwarg_or("step_ms", 1000) {
        Ok(step) => step,
        Err(e) => return Outcome::failure(e),
    };

    for step in 1..=duration {
        let meta = json!({
            "current": step,
            "total": duration,
            "status": format!("Processing step {step} of {duration}"),
        });
        if let Err(e) = ctx.report_progress(meta).await {
            warn!(error = %e, "progress update failed");
        }
        tokio::select! {
            _ = ctx.cancelled() => {
                return Outcome::failure(format!("stopped at step {step} of {duration}"));
            }
            _ = tokio::time::sleep(Duration::from_millis(step_ms)) => {}
        }
    }

    Outcome::success(json!({
        "status": "completed",
        "duration": duration,
        "task_id": ctx.task_id().to_string(),
    }))
}

/// `task_with_retry(should_fail=false)`: with `should_fail`, asks for a
/// retry in 5 s on the first two runs and succeeds on the third.
pub async fn task_with_retry(payload: TaskPayload, ctx: TaskContext) -> Outcome {
    let should_fail: bool = match payload.param_or(0, "should_fail", false) {
        Ok(flag) => flag,
        Err(e) => return Outcome::failure(e),
    };
    let countdown_ms: u64 = match payload.kwarg_or("countdown_ms", 5000) {
        Ok(ms) => ms,
        Err(e) => return Outcome::failure(e),
    };

    info!(attempt = ctx.retries() + 1, "running task_with_retry");
    if should_fail && ctx.retries() < 2 {
        warn!(attempt = ctx.retries() + 1, "failing on purpose, retrying");
        return ctx.request_retry(Duration::from_millis(countdown_ms));
    }

    Outcome::success(json!({
        "status": "success",
        "attempts": ctx.retries() + 1,
        "task_id": ctx.task_id().to_string(),
    }))
}
