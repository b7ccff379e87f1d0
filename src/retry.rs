//! Retry manager: bounded, delayed re-delivery of the same task.
//!
//! A retry keeps the task id. A copy of the message with `retries + 1` and a
//! future eta is published, then the record moves to RETRY with the retry
//! count bumped. The broker withholds the copy until the eta passes. Once the ceiling
//! is reached the record fails with `RetriesExhausted` instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::broker::BrokerClient;
use crate::error::{Error, Result};
use crate::model::{RecordPatch, State, TaskError, TaskErrorKind, TaskMessage, TaskRecord};
use crate::store::TaskStore;
use crate::telemetry::metrics;

/// What [`RetryManager::schedule`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-published; the next delivery is withheld until `eta`.
    Scheduled { eta: DateTime<Utc>, retries: u32 },
    /// No retries left. The record is now FAILURE.
    Exhausted,
}

#[derive(Clone)]
pub struct RetryManager {
    broker: BrokerClient,
    store: Arc<dyn TaskStore>,
}

impl RetryManager {
    pub fn new(broker: BrokerClient, store: Arc<dyn TaskStore>) -> Self {
        Self { broker, store }
    }

    /// Schedule another run of `message` after `countdown`, or fail the task
    /// if `max_retries` is spent.
    ///
    /// `reason` ends up in the failure message when retries are exhausted.
    pub async fn schedule(
        &self,
        message: &TaskMessage,
        countdown: Duration,
        max_retries: u32,
        reason: &str,
    ) -> Result<(RetryDecision, TaskRecord)> {
        let retries = message.headers.retries;
        if retries >= max_retries {
            warn!(
                task_id = %message.id,
                task = %message.name,
                retries,
                max_retries,
                "retries exhausted"
            );
            let error = TaskError::new(
                TaskErrorKind::RetriesExhausted,
                format!("gave up after {retries} retries: {reason}"),
            );
            let record = self
                .store
                .transition(message.id, State::Failure, RecordPatch::failure(error))
                .await?;
            return Ok((RetryDecision::Exhausted, record));
        }

        // The record keeps matching the unacked delivery until the copy is
        // in the broker.
        let next = message.for_retry(countdown, Utc::now());
        self.broker.publish(&next).await?;

        let record = match self
            .store
            .transition(
                message.id,
                State::Retry,
                RecordPatch::retry(next.headers.retries),
            )
            .await
        {
            Ok(record) => record,
            Err(Error::InvalidTransition { from, .. }) => {
                // The copy was already picked up and moved the record on.
                info!(task_id = %message.id, state = %from, "retry copy already in flight");
                self.store
                    .get(message.id)
                    .await?
                    .ok_or_else(|| Error::NotFound(message.id.to_string()))?
            }
            Err(e) => return Err(e),
        };

        metrics::task_retries().add(1, &[KeyValue::new("task", message.name.clone())]);
        let eta = next.headers.eta.unwrap_or(next.headers.published_at);
        info!(
            task_id = %message.id,
            task = %message.name,
            retries = next.headers.retries,
            max_retries,
            %eta,
            "retry scheduled"
        );
        Ok((
            RetryDecision::Scheduled {
                eta,
                retries: next.headers.retries,
            },
            record,
        ))
    }
}
