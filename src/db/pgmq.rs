//! pgmq queue operations via direct SQLx, and the [`Broker`] built on them.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive, pgmq.delete. Each logical task queue maps to one pgmq
//! queue named `taskq_<queue>`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::warn;

use crate::broker::{Broker, ControlStream, Delivery};
use crate::control::ControlMessage;
use crate::error::{Error, Result};
use crate::model::TaskMessage;
use crate::telemetry::metrics;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

/// pgmq queue backing a logical queue. pgmq names become table names, so
/// anything but ASCII alphanumerics and `_` is replaced.
pub fn pgmq_queue_name(queue: &str) -> String {
    let sanitized: String = queue
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("taskq_{sanitized}")
}

/// Whole seconds until `message` is due, rounded up so it is never early.
pub fn delay_seconds(message: &TaskMessage) -> i32 {
    let Some(eta) = message.headers.eta else {
        return 0;
    };
    let millis = (eta - Utc::now()).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        i32::try_from((millis + 999) / 1000).unwrap_or(i32::MAX)
    }
}

fn record_operation(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        record_operation(queue_name, "create");
        Ok(())
    }

    /// Create the pgmq queue for `queue` unless this handle already did.
    async fn ensure_queue(&self, queue: &str) -> Result<String> {
        let queue_name = pgmq_queue_name(queue);
        if self.queues.lock().contains(&queue_name) {
            return Ok(queue_name);
        }
        self.create_queue(&queue_name).await?;
        self.queues.lock().insert(queue_name.clone());
        Ok(queue_name)
    }

    /// Send a message to a pgmq queue. Returns the message ID.
    /// delay_seconds: 0 for immediate, >0 for delayed delivery.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        delay_seconds: i32,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue_name)
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(&self.pool)
            .await?;
        record_operation(queue_name, "send");
        Ok(row.0)
    }

    /// Read the next message from a queue (visibility timeout in seconds).
    /// Returns None if queue is empty.
    pub async fn read_from_queue(
        &self,
        queue_name: &str,
        vt_seconds: i32,
    ) -> Result<Option<PgmqMessage>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)")
        .bind(queue_name)
        .bind(vt_seconds)
        .fetch_optional(&self.pool)
        .await?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
            msg_id,
            read_ct,
            enqueued_at,
            vt,
            message,
        });
        record_operation(queue_name, if msg.is_some() { "read" } else { "read_empty" });
        Ok(msg)
    }

    /// Archive a message (moves to archive table, preserves for audit).
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        record_operation(queue_name, "archive");
        Ok(())
    }

    /// Delete a message permanently.
    pub async fn delete_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        record_operation(queue_name, "delete");
        Ok(())
    }
}

#[async_trait]
impl Broker for super::Db {
    async fn publish(&self, message: &TaskMessage) -> Result<()> {
        let queue_name = self.ensure_queue(&message.queue).await?;
        let payload = serde_json::to_value(message)?;
        self.send_to_queue(&queue_name, &payload, delay_seconds(message))
            .await?;
        Ok(())
    }

    async fn fetch(&self, queue: &str, visibility: Duration) -> Result<Option<Delivery>> {
        let queue_name = self.ensure_queue(queue).await?;
        let vt_seconds = i32::try_from(visibility.as_secs().max(1)).unwrap_or(i32::MAX);
        let Some(raw) = self.read_from_queue(&queue_name, vt_seconds).await? else {
            return Ok(None);
        };

        match serde_json::from_value::<TaskMessage>(raw.message) {
            Ok(message) => Ok(Some(Delivery {
                tag: raw.msg_id,
                queue: queue.to_string(),
                read_count: raw.read_ct,
                message,
            })),
            Err(e) => {
                warn!(queue, msg_id = raw.msg_id, error = %e, "undecodable message, archiving");
                self.archive_message(&queue_name, raw.msg_id).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.delete_message(&pgmq_queue_name(&delivery.queue), delivery.tag)
            .await
    }

    async fn reject(&self, delivery: &Delivery) -> Result<()> {
        self.archive_message(&pgmq_queue_name(&delivery.queue), delivery.tag)
            .await
    }

    async fn broadcast(&self, message: &ControlMessage) -> Result<()> {
        self.notify_control(message).await
    }

    async fn subscribe_control(&self) -> Result<ControlStream> {
        self.listen_control().await
    }

    async fn ping(&self) -> Result<()> {
        self.health_check().await.map_err(|e| match e {
            Error::Database(inner) => Error::Transport(inner.to_string()),
            other => other,
        })
    }
}
