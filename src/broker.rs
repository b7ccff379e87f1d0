//! Broker seam: publish, consume with late acknowledgement, control broadcast.
//!
//! [`Broker`] is implemented by the pgmq-backed [`Db`](crate::db::Db) and by
//! [`MemoryBroker`](crate::memory::MemoryBroker). Components never hold a
//! broker directly; they hold a [`BrokerClient`], which retries transient
//! transport failures with bounded backoff and surfaces
//! [`Error::BrokerUnavailable`] once the budget is spent.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::backoff::BackoffPolicy;
use crate::control::ControlMessage;
use crate::error::{Error, Result};
use crate::model::TaskMessage;
use crate::telemetry::metrics;

/// Control messages as they arrive on a subscription.
pub type ControlStream = mpsc::Receiver<ControlMessage>;

/// A message handed to one consumer. Invisible to others until acked,
/// rejected, or its visibility timeout lapses.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned tag, unique per queue.
    pub tag: i64,
    pub queue: String,
    /// How many times this message has been handed out, this one included.
    pub read_count: i32,
    pub message: TaskMessage,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.read_count > 1
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a message. Honors `headers.eta` by withholding delivery.
    async fn publish(&self, message: &TaskMessage) -> Result<()>;

    /// Take at most one due message from `queue`, hidden from other
    /// consumers for `visibility`.
    async fn fetch(&self, queue: &str, visibility: Duration) -> Result<Option<Delivery>>;

    /// Processing finished; drop the message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Drop the message without processing it (kept for audit where supported).
    async fn reject(&self, delivery: &Delivery) -> Result<()>;

    /// Send a control message to every subscriber, bypassing task queues.
    async fn broadcast(&self, message: &ControlMessage) -> Result<()>;

    /// Start receiving control messages. The subscription is live when this
    /// returns, so a broadcast issued afterwards is never missed.
    async fn subscribe_control(&self) -> Result<ControlStream>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<()>;
}

/// Shared handle to a broker with reconnect/backoff.
#[derive(Clone)]
pub struct BrokerClient {
    broker: Arc<dyn Broker>,
    backoff: BackoffPolicy,
}

impl BrokerClient {
    pub fn new(broker: Arc<dyn Broker>, backoff: BackoffPolicy) -> Self {
        Self { broker, backoff }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub async fn publish(&self, message: &TaskMessage) -> Result<()> {
        self.with_reconnect("publish", || self.broker.publish(message))
            .await
    }

    pub async fn fetch(&self, queue: &str, visibility: Duration) -> Result<Option<Delivery>> {
        self.with_reconnect("fetch", || self.broker.fetch(queue, visibility))
            .await
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.with_reconnect("ack", || self.broker.ack(delivery)).await
    }

    pub async fn reject(&self, delivery: &Delivery) -> Result<()> {
        self.with_reconnect("reject", || self.broker.reject(delivery))
            .await
    }

    pub async fn broadcast(&self, message: &ControlMessage) -> Result<()> {
        self.with_reconnect("broadcast", || self.broker.broadcast(message))
            .await
    }

    pub async fn subscribe_control(&self) -> Result<ControlStream> {
        self.with_reconnect("subscribe_control", || self.broker.subscribe_control())
            .await
    }

    /// Single attempt, no backoff. Probes want a fast answer.
    pub async fn ping(&self) -> Result<()> {
        self.broker.ping().await
    }

    async fn with_reconnect<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry < self.backoff.max_retries => {
                    retry += 1;
                    let delay = self.backoff.delay(retry);
                    warn!(
                        operation,
                        retry,
                        max_retries = self.backoff.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "broker operation failed, reconnecting"
                    );
                    metrics::broker_reconnects().add(1, &[KeyValue::new("operation", operation)]);
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    error!(operation, attempts = retry + 1, error = %e, "broker unavailable");
                    return Err(Error::BrokerUnavailable {
                        attempts: retry + 1,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}
