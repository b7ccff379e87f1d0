//! Processing one delivery: dedupe, state transitions, handler execution
//! under time limits, outcome recording, and the late ack.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::Worker;
use crate::broker::Delivery;
use crate::context::{Outcome, TaskContext};
use crate::error::{Error, Result};
use crate::model::{
    ActiveTask, DEFAULT_MAX_RETRIES, RecordPatch, State, TaskError, TaskErrorKind, TaskMessage,
    TaskPayload,
};
use crate::registry::RegisteredTask;
use crate::retry::RetryDecision;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

/// How a handler invocation ended, as seen from outside it.
enum Execution {
    Completed(Outcome),
    Panicked(String),
    HardTimeout,
    Terminated,
}

impl Worker {
    /// Take one delivery from RECEIVED to a recorded outcome, then ack it.
    ///
    /// Returning an error leaves the message unacked, so the broker hands it
    /// out again once the visibility timeout lapses.
    pub(super) async fn process(&self, delivery: Delivery) -> Result<()> {
        let message = &delivery.message;
        let span = start_task_span(
            &message.name,
            &message.id,
            &delivery.queue,
            message.headers.retries,
        );
        self.process_inner(&delivery).instrument(span).await
    }

    async fn process_inner(&self, delivery: &Delivery) -> Result<()> {
        let span = Span::current();
        let message = &delivery.message;
        let store = &self.inner.store;

        let current = match store.get(message.id).await? {
            Some(record) if record.state.is_terminal() => {
                debug!(state = %record.state, "task already finished, dropping duplicate");
                return self.inner.broker.ack(delivery).await;
            }
            Some(record) if record.retries > message.headers.retries => {
                debug!(
                    record_retries = record.retries,
                    message_retries = message.headers.retries,
                    "stale delivery superseded by a retry, dropping"
                );
                return self.inner.broker.ack(delivery).await;
            }
            Some(record) => record.state,
            None => {
                store.insert_pending(message).await?;
                State::Pending
            }
        };

        if self.is_revoked(message.id) {
            return self.drop_revoked(delivery, current).await;
        }
        if delivery.is_redelivery() {
            info!(read_count = delivery.read_count, state = %current, "redelivered task");
        }

        let registered = self.inner.registry.get(&message.name).ok();
        let max_retries = message
            .headers
            .max_retries
            .or_else(|| registered.and_then(|t| t.options.max_retries))
            .unwrap_or(DEFAULT_MAX_RETRIES);

        let received = RecordPatch::received(self.id(), max_retries);
        match store.transition(message.id, State::Received, received).await {
            Ok(_) => record_state_transition(&span, current, State::Received),
            Err(Error::InvalidTransition { from, .. }) => {
                info!(state = %from, "task no longer runnable, dropping");
                return self.inner.broker.ack(delivery).await;
            }
            Err(e) => return Err(e),
        }

        let Some(task) = registered else {
            return self.reject_unknown(delivery).await;
        };

        let record = match store
            .transition(message.id, State::Started, RecordPatch::default())
            .await
        {
            Ok(record) => record,
            Err(Error::InvalidTransition { from, .. }) => {
                info!(state = %from, "task revoked before start, dropping");
                return self.inner.broker.ack(delivery).await;
            }
            Err(e) => return Err(e),
        };
        record_state_transition(&span, State::Received, State::Started);

        let ctx = TaskContext::new(
            message,
            max_retries,
            record.attempts,
            self.id(),
            Arc::clone(store),
        );
        let terminate = self.track(
            message.id,
            ActiveTask {
                task_id: message.id,
                name: message.name.clone(),
                queue: delivery.queue.clone(),
                attempt: record.attempts,
                started_at: Utc::now(),
            },
        );

        let soft = task
            .options
            .soft_time_limit
            .unwrap_or(self.inner.config.soft_time_limit);
        let hard = task
            .options
            .hard_time_limit
            .unwrap_or(self.inner.config.hard_time_limit);

        let started = Instant::now();
        let execution = execute(task, message.payload(), ctx.clone(), soft, hard, terminate).await;
        let elapsed = started.elapsed();
        self.untrack(message.id, &message.name);

        let label = self
            .record_outcome(message, &ctx, execution, max_retries, soft, hard, &span)
            .await?;
        metrics::task_duration_ms().record(
            elapsed.as_secs_f64() * 1000.0,
            &[
                KeyValue::new("task", message.name.clone()),
                KeyValue::new("outcome", label),
            ],
        );

        self.inner.broker.ack(delivery).await
    }

    /// Translate an execution into the record's next state.
    ///
    /// Returns the outcome label used for metrics.
    #[allow(clippy::too_many_arguments)]
    async fn record_outcome(
        &self,
        message: &TaskMessage,
        ctx: &TaskContext,
        execution: Execution,
        max_retries: u32,
        soft: Duration,
        hard: Duration,
        span: &Span,
    ) -> Result<&'static str> {
        let from = ctx.last_state();
        let (to, patch) = match execution {
            Execution::Completed(Outcome::Success(value)) => {
                info!("task succeeded");
                (State::Success, RecordPatch::success(value))
            }
            Execution::Completed(Outcome::RetryRequested { countdown }) => {
                return self
                    .retry(message, from, countdown, max_retries, "retry requested", span)
                    .await;
            }
            Execution::Completed(Outcome::Failure(reason)) => {
                if let Some(countdown) = ctx.pending_retry() {
                    return self
                        .retry(message, from, countdown, max_retries, &reason, span)
                        .await;
                }
                let kind = if ctx.soft_limit_exceeded() {
                    TaskErrorKind::TimeoutExceeded
                } else {
                    TaskErrorKind::Handler
                };
                warn!(%kind, %reason, "task failed");
                (State::Failure, RecordPatch::failure(TaskError::new(kind, reason)))
            }
            Execution::Panicked(reason) => {
                error!(%reason, "task handler panicked");
                (
                    State::Failure,
                    RecordPatch::failure(TaskError::new(
                        TaskErrorKind::Handler,
                        format!("handler panicked: {reason}"),
                    )),
                )
            }
            Execution::HardTimeout => {
                let reason = format!(
                    "hard time limit of {}s exceeded (soft limit {}s)",
                    hard.as_secs_f64(),
                    soft.as_secs_f64()
                );
                error!(%reason, "task stopped");
                (
                    State::Failure,
                    RecordPatch::failure(TaskError::new(TaskErrorKind::TimeoutExceeded, reason)),
                )
            }
            Execution::Terminated => {
                warn!("task terminated by revoke");
                (
                    State::Failure,
                    RecordPatch::failure(TaskError::new(
                        TaskErrorKind::Terminated,
                        "terminated by revoke",
                    )),
                )
            }
        };

        let label = if to == State::Success {
            "success"
        } else {
            "failure"
        };
        match self.inner.store.transition(message.id, to, patch).await {
            Ok(_) => record_state_transition(span, from, to),
            Err(e @ (Error::InvalidTransition { .. } | Error::NotFound(_))) => {
                warn!(error = %e, "could not record outcome");
            }
            Err(e) => return Err(e),
        }
        Ok(label)
    }

    async fn retry(
        &self,
        message: &TaskMessage,
        from: State,
        countdown: Duration,
        max_retries: u32,
        reason: &str,
        span: &Span,
    ) -> Result<&'static str> {
        let (decision, _) = self
            .inner
            .retry
            .schedule(message, countdown, max_retries, reason)
            .await?;
        match decision {
            RetryDecision::Scheduled { .. } => {
                record_state_transition(span, from, State::Retry);
                Ok("retry")
            }
            RetryDecision::Exhausted => {
                record_state_transition(span, from, State::Failure);
                Ok("failure")
            }
        }
    }

    async fn drop_revoked(&self, delivery: &Delivery, current: State) -> Result<()> {
        if current.can_transition_to(State::Revoked) {
            match self
                .inner
                .store
                .transition(delivery.message.id, State::Revoked, RecordPatch::default())
                .await
            {
                Ok(_) => record_state_transition(&Span::current(), current, State::Revoked),
                Err(e @ (Error::InvalidTransition { .. } | Error::NotFound(_))) => {
                    debug!(error = %e, "revoked task changed state concurrently");
                }
                Err(e) => return Err(e),
            }
        }
        info!("task revoked, dropping delivery");
        self.inner.broker.ack(delivery).await
    }

    async fn reject_unknown(&self, delivery: &Delivery) -> Result<()> {
        let message = &delivery.message;
        error!(task = %message.name, "no handler registered, rejecting");
        metrics::tasks_unroutable().add(1, &[KeyValue::new("task", message.name.clone())]);

        let error = TaskError::new(
            TaskErrorKind::UnknownTask,
            format!("no handler registered for `{}`", message.name),
        );
        match self
            .inner
            .store
            .transition(message.id, State::Failure, RecordPatch::failure(error))
            .await
        {
            Ok(_) => record_state_transition(&Span::current(), State::Received, State::Failure),
            Err(e @ (Error::InvalidTransition { .. } | Error::NotFound(_))) => {
                warn!(error = %e, "could not record unknown task");
            }
            Err(e) => return Err(e),
        }
        self.inner.broker.reject(delivery).await
    }
}

/// Run the handler on its own task and police its time limits.
///
/// At the soft limit the context's token is cancelled and the handler may
/// wrap up. At the hard limit, or on terminate, the handler's task is
/// aborted. Abort takes effect at the handler's next await point.
async fn execute(
    task: &RegisteredTask,
    payload: TaskPayload,
    ctx: TaskContext,
    soft: Duration,
    hard: Duration,
    terminate: CancellationToken,
) -> Execution {
    let handler = Arc::clone(&task.handler);
    let soft_limit = ctx.soft_limit_token();
    let mut join = tokio::spawn(async move { handler.run(payload, ctx).await }.in_current_span());

    let soft_deadline = tokio::time::sleep(soft);
    let hard_deadline = tokio::time::sleep(hard);
    tokio::pin!(soft_deadline, hard_deadline);
    let mut soft_fired = false;

    loop {
        tokio::select! {
            joined = &mut join => {
                return match joined {
                    Ok(outcome) => Execution::Completed(outcome),
                    Err(e) if e.is_panic() => Execution::Panicked(panic_message(e.into_panic())),
                    Err(_) => Execution::Terminated,
                };
            }
            _ = &mut soft_deadline, if !soft_fired => {
                soft_fired = true;
                warn!(soft_limit_secs = soft.as_secs_f64(), "soft time limit exceeded");
                soft_limit.cancel();
            }
            _ = &mut hard_deadline => {
                join.abort();
                return Execution::HardTimeout;
            }
            _ = terminate.cancelled() => {
                join.abort();
                return Execution::Terminated;
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
