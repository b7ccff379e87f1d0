//! What a worker reports about itself to the control plane.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskId;

/// A task currently executing on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub task_id: TaskId,
    pub name: String,
    pub queue: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

/// Ephemeral descriptor of a running worker. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub queues: Vec<String>,
    pub concurrency: usize,
    pub in_flight: Vec<TaskId>,
    /// Completed executions by task name.
    pub processed: BTreeMap<String, u64>,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub pid: u32,
}

impl WorkerStats {
    pub fn total_processed(&self) -> u64 {
        self.processed.values().sum()
    }
}
