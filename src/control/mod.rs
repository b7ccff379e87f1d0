//! Control plane: revoke and inspect across every live worker.
//!
//! A command goes out on the broker's broadcast channel; each addressed
//! worker answers on the same channel quoting the command's `reply_to`.
//! Replies are collected until a deadline, so a slow or dead worker yields
//! a partial answer rather than an error.

mod message;

pub use message::{ControlCommand, ControlMessage, ControlReply};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::BrokerClient;
use crate::error::{Error, Result};
use crate::model::{ActiveTask, RecordPatch, State, TaskId, WorkerStats};
use crate::store::TaskStore;
use crate::telemetry::metrics;

/// Default wait for worker replies.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of a revoke.
#[derive(Debug, Clone, PartialEq)]
pub struct RevokeAck {
    pub task_id: TaskId,
    /// Record state after the revoke. None when the id is unknown.
    pub state: Option<State>,
    /// Workers that acknowledged the revoke.
    pub acknowledged_by: Vec<String>,
    /// Workers that stopped a running execution.
    pub terminated_by: Vec<String>,
}

#[derive(Clone)]
pub struct ControlPlane {
    broker: BrokerClient,
    store: Arc<dyn TaskStore>,
    reply_timeout: Duration,
}

impl ControlPlane {
    pub fn new(broker: BrokerClient, store: Arc<dyn TaskStore>) -> Self {
        Self {
            broker,
            store,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    /// Send `command` to workers and collect replies for up to `timeout`.
    ///
    /// Returns early once `expected` replies are in. `destination` limits
    /// the command to the named workers.
    pub async fn broadcast(
        &self,
        command: ControlCommand,
        destination: Option<Vec<String>>,
        timeout: Duration,
        expected: Option<usize>,
    ) -> Result<HashMap<String, ControlReply>> {
        let mut replies_rx = self.broker.subscribe_control().await?;
        let reply_to = Uuid::new_v4();
        let command_name = command_name(&command);
        let expected = expected.or_else(|| destination.as_ref().map(Vec::len));

        self.broker
            .broadcast(&ControlMessage::Command {
                reply_to,
                destination,
                command,
            })
            .await?;
        metrics::control_commands().add(1, &[KeyValue::new("command", command_name)]);

        let deadline = Instant::now() + timeout;
        let mut replies = HashMap::new();
        loop {
            if expected.is_some_and(|n| replies.len() >= n) {
                break;
            }
            let received = tokio::time::timeout_at(deadline, replies_rx.recv()).await;
            let message = match received {
                Ok(Some(message)) => message,
                Ok(None) | Err(_) => break,
            };
            if let ControlMessage::Reply {
                reply_to: id,
                worker_id,
                reply,
            } = message
            {
                if id == reply_to {
                    replies.insert(worker_id, reply);
                }
            }
        }

        debug!(
            command = command_name,
            replies = replies.len(),
            "control replies collected"
        );
        Ok(replies)
    }

    /// Revoke a task.
    ///
    /// A task that has not started becomes REVOKED and will be dropped on
    /// delivery. A running task keeps running unless `terminate` is set, in
    /// which case the worker running it stops it and records FAILURE.
    /// Revoking a finished task changes nothing.
    pub async fn revoke(&self, task_id: TaskId, terminate: bool) -> Result<RevokeAck> {
        let state = match self
            .store
            .transition(task_id, State::Revoked, RecordPatch::default())
            .await
        {
            Ok(record) => Some(record.state),
            Err(Error::InvalidTransition { from, .. }) => Some(from),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let replies = self
            .broadcast(
                ControlCommand::Revoke { task_id, terminate },
                None,
                self.reply_timeout,
                None,
            )
            .await?;

        let mut acknowledged_by = Vec::new();
        let mut terminated_by = Vec::new();
        for (worker_id, reply) in replies {
            if let ControlReply::Revoked { terminated, .. } = reply {
                if terminated {
                    terminated_by.push(worker_id.clone());
                }
                acknowledged_by.push(worker_id);
            }
        }
        acknowledged_by.sort();
        terminated_by.sort();

        info!(
            %task_id,
            terminate,
            state = state.map_or("NOT_FOUND", State::as_str),
            workers = acknowledged_by.len(),
            terminated = terminated_by.len(),
            "task revoked"
        );
        Ok(RevokeAck {
            task_id,
            state,
            acknowledged_by,
            terminated_by,
        })
    }

    /// Running tasks, keyed by worker id.
    pub async fn inspect_active(&self) -> Result<HashMap<String, Vec<ActiveTask>>> {
        let replies = self
            .broadcast(ControlCommand::InspectActive, None, self.reply_timeout, None)
            .await?;
        Ok(replies
            .into_iter()
            .filter_map(|(worker, reply)| match reply {
                ControlReply::Active { tasks } => Some((worker, tasks)),
                _ => None,
            })
            .collect())
    }

    /// Worker descriptors, keyed by worker id.
    pub async fn inspect_stats(&self) -> Result<HashMap<String, WorkerStats>> {
        let replies = self
            .broadcast(ControlCommand::InspectStats, None, self.reply_timeout, None)
            .await?;
        Ok(replies
            .into_iter()
            .filter_map(|(worker, reply)| match reply {
                ControlReply::Stats { stats } => Some((worker, stats)),
                _ => None,
            })
            .collect())
    }

    /// Ids of workers that answered a ping within `timeout`, sorted.
    pub async fn ping(&self, timeout: Duration) -> Result<Vec<String>> {
        let replies = self
            .broadcast(ControlCommand::Ping, None, timeout, None)
            .await?;
        let mut workers: Vec<String> = replies
            .into_iter()
            .filter(|(_, reply)| *reply == ControlReply::Pong)
            .map(|(worker, _)| worker)
            .collect();
        workers.sort();
        Ok(workers)
    }
}

fn command_name(command: &ControlCommand) -> &'static str {
    match command {
        ControlCommand::Revoke { .. } => "revoke",
        ControlCommand::InspectActive => "inspect_active",
        ControlCommand::InspectStats => "inspect_stats",
        ControlCommand::Ping => "ping",
    }
}
