//! Per-invocation handle passed to every handler.
//!
//! The context is the handler's only way to touch its own task:
//! [`report_progress`](TaskContext::report_progress) moves the record to
//! PROGRESS, [`request_retry`](TaskContext::request_retry) asks the worker
//! loop for a delayed re-delivery. The soft time limit is observed through
//! [`soft_limit_exceeded`](TaskContext::soft_limit_exceeded) and
//! [`cancelled`](TaskContext::cancelled).

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{RecordPatch, State, TaskId, TaskMessage};
use crate::store::TaskStore;

/// What a handler invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(String),
    /// Not a failure: re-run after `countdown`, bounded by max retries.
    RetryRequested { countdown: Duration },
}

impl Outcome {
    /// Serialize `value` as the task result.
    pub fn success(value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => Outcome::Success(v),
            Err(e) => Outcome::Failure(format!("result is not serializable: {e}")),
        }
    }

    pub fn failure(error: impl Display) -> Self {
        Outcome::Failure(error.to_string())
    }
}

impl<T: Serialize, E: Display> From<std::result::Result<T, E>> for Outcome {
    fn from(result: std::result::Result<T, E>) -> Self {
        match result {
            Ok(value) => Outcome::success(value),
            Err(e) => Outcome::failure(e),
        }
    }
}

struct ContextInner {
    task_id: TaskId,
    name: String,
    queue: String,
    retries: u32,
    max_retries: u32,
    attempt: u32,
    worker_id: String,
    store: Arc<dyn TaskStore>,
    soft_limit: CancellationToken,
    retry_request: Mutex<Option<Duration>>,
    progressed: AtomicBool,
}

#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

impl TaskContext {
    pub(crate) fn new(
        message: &TaskMessage,
        max_retries: u32,
        attempt: u32,
        worker_id: &str,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                task_id: message.id,
                name: message.name.clone(),
                queue: message.queue.clone(),
                retries: message.headers.retries,
                max_retries,
                attempt,
                worker_id: worker_id.to_string(),
                store,
                soft_limit: CancellationToken::new(),
                retry_request: Mutex::new(None),
                progressed: AtomicBool::new(false),
            }),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.inner.task_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    /// Retries already spent before this run.
    pub fn retries(&self) -> u32 {
        self.inner.retries
    }

    pub fn max_retries(&self) -> u32 {
        self.inner.max_retries
    }

    /// 1-based count of handler invocations for this task, this one included.
    pub fn attempt(&self) -> u32 {
        self.inner.attempt
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Record partial status. The task shows as PROGRESS with `meta`.
    pub async fn report_progress(&self, meta: Value) -> Result<()> {
        self.inner
            .store
            .transition(self.inner.task_id, State::Progress, RecordPatch::progress(meta))
            .await?;
        self.inner.progressed.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Ask for a re-run after `countdown`.
    ///
    /// Return the value from the handler. If the handler instead goes on to
    /// fail, the request still stands and the failure becomes a retry.
    pub fn request_retry(&self, countdown: Duration) -> Outcome {
        *self.inner.retry_request.lock() = Some(countdown);
        Outcome::RetryRequested { countdown }
    }

    pub fn soft_limit_exceeded(&self) -> bool {
        self.inner.soft_limit.is_cancelled()
    }

    /// Resolves once the soft time limit has passed.
    pub async fn cancelled(&self) {
        self.inner.soft_limit.cancelled().await
    }

    pub(crate) fn soft_limit_token(&self) -> CancellationToken {
        self.inner.soft_limit.clone()
    }

    pub(crate) fn pending_retry(&self) -> Option<Duration> {
        *self.inner.retry_request.lock()
    }

    /// The record's current state as far as this invocation knows.
    pub(crate) fn last_state(&self) -> State {
        if self.inner.progressed.load(Ordering::Relaxed) {
            State::Progress
        } else {
            State::Started
        }
    }
}
