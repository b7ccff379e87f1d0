//! In-process broker.
//!
//! Per queue: a FIFO of ready messages, a min-heap of messages whose eta
//! has not arrived, and the set of handed-out messages with the instant they
//! become visible again. Due messages are promoted and lapsed deliveries are
//! returned to the front of the queue on every fetch.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::broker::{Broker, ControlStream, Delivery};
use crate::control::ControlMessage;
use crate::error::{Error, Result};
use crate::model::TaskMessage;

const CONTROL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Stored {
    tag: i64,
    read_count: i32,
    message: TaskMessage,
}

#[derive(Debug)]
struct Delayed {
    eta: DateTime<Utc>,
    stored: Stored,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.eta, self.stored.tag).cmp(&(other.eta, other.stored.tag))
    }
}

#[derive(Debug)]
struct InFlight {
    stored: Stored,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    unacked: HashMap<i64, InFlight>,
    archived: Vec<TaskMessage>,
}

impl QueueState {
    fn promote(&mut self, now: DateTime<Utc>, instant: Instant) {
        while self
            .delayed
            .peek()
            .is_some_and(|Reverse(next)| next.eta <= now)
        {
            if let Some(Reverse(due)) = self.delayed.pop() {
                self.ready.push_back(due.stored);
            }
        }

        let mut lapsed: Vec<i64> = self
            .unacked
            .iter()
            .filter(|(_, f)| f.visible_at <= instant)
            .map(|(tag, _)| *tag)
            .collect();
        // Oldest first, so lapsed messages keep their original order.
        lapsed.sort_unstable_by(|a, b| b.cmp(a));
        for tag in lapsed {
            if let Some(flight) = self.unacked.remove(&tag) {
                debug!(tag, task_id = %flight.stored.message.id, "visibility lapsed, requeueing");
                self.ready.push_front(flight.stored);
            }
        }
    }
}

/// Counts of messages in each holding area of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: usize,
    pub delayed: usize,
    pub unacked: usize,
    pub archived: usize,
}

impl QueueDepth {
    /// Messages not yet acked or rejected.
    pub fn outstanding(&self) -> usize {
        self.ready + self.delayed + self.unacked
    }
}

pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    control: broadcast::Sender<ControlMessage>,
    next_tag: AtomicI64,
    available: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (control, _) = broadcast::channel(CONTROL_CAPACITY);
        Self {
            queues: Mutex::new(HashMap::new()),
            control,
            next_tag: AtomicI64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the connection. While unavailable every
    /// operation fails with a transient transport error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn depth(&self, queue: &str) -> QueueDepth {
        let queues = self.queues.lock();
        queues
            .get(queue)
            .map(|q| QueueDepth {
                ready: q.ready.len(),
                delayed: q.delayed.len(),
                unacked: q.unacked.len(),
                archived: q.archived.len(),
            })
            .unwrap_or_default()
    }

    /// Messages dropped through `reject`.
    pub fn archived(&self, queue: &str) -> Vec<TaskMessage> {
        let queues = self.queues.lock();
        queues
            .get(queue)
            .map(|q| q.archived.clone())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Transport("memory broker: connection refused".to_string()))
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, message: &TaskMessage) -> Result<()> {
        self.check_available()?;
        let stored = Stored {
            tag: self.next_tag.fetch_add(1, Ordering::SeqCst),
            read_count: 0,
            message: message.clone(),
        };

        let mut queues = self.queues.lock();
        let queue = queues.entry(message.queue.clone()).or_default();
        match message.headers.eta {
            Some(eta) if eta > Utc::now() => queue.delayed.push(Reverse(Delayed { eta, stored })),
            _ => queue.ready.push_back(stored),
        }
        Ok(())
    }

    async fn fetch(&self, queue: &str, visibility: Duration) -> Result<Option<Delivery>> {
        self.check_available()?;
        let now = Utc::now();
        let instant = Instant::now();

        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };
        state.promote(now, instant);

        let Some(mut stored) = state.ready.pop_front() else {
            return Ok(None);
        };
        stored.read_count += 1;

        let delivery = Delivery {
            tag: stored.tag,
            queue: queue.to_string(),
            read_count: stored.read_count,
            message: stored.message.clone(),
        };
        state.unacked.insert(
            stored.tag,
            InFlight {
                stored,
                visible_at: instant + visibility,
            },
        );
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.check_available()?;
        let mut queues = self.queues.lock();
        if let Some(state) = queues.get_mut(&delivery.queue) {
            if state.unacked.remove(&delivery.tag).is_none() {
                // Lapsed and possibly handed to someone else already.
                state.ready.retain(|s| s.tag != delivery.tag);
            }
        }
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<()> {
        self.check_available()?;
        let mut queues = self.queues.lock();
        if let Some(state) = queues.get_mut(&delivery.queue) {
            state.unacked.remove(&delivery.tag);
            state.ready.retain(|s| s.tag != delivery.tag);
            state.archived.push(delivery.message.clone());
        }
        Ok(())
    }

    async fn broadcast(&self, message: &ControlMessage) -> Result<()> {
        self.check_available()?;
        // No subscribers is not an error: nobody is listening.
        let _ = self.control.send(message.clone());
        Ok(())
    }

    async fn subscribe_control(&self) -> Result<ControlStream> {
        self.check_available()?;
        let mut rx = self.control.subscribe();
        let (tx, out) = mpsc::channel(CONTROL_CAPACITY);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "control subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out)
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}
