//! Client facade: submit work, query status, revoke, inspect.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::info;

use crate::broker::BrokerClient;
use crate::control::{ControlPlane, RevokeAck};
use crate::error::Result;
use crate::model::{NewTask, State, TaskId, TaskRecord, TaskStatus, WorkerStats};
use crate::store::TaskStore;
use crate::telemetry::metrics;

/// Everything a caller needs, passed around as one value.
#[derive(Clone)]
pub struct TaskClient {
    broker: BrokerClient,
    store: Arc<dyn TaskStore>,
    control: ControlPlane,
}

impl TaskClient {
    pub fn new(broker: BrokerClient, store: Arc<dyn TaskStore>) -> Self {
        let control = ControlPlane::new(broker.clone(), Arc::clone(&store));
        Self {
            broker,
            store,
            control,
        }
    }

    pub fn with_control(mut self, control: ControlPlane) -> Self {
        self.control = control;
        self
    }

    pub fn broker(&self) -> &BrokerClient {
        &self.broker
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn control(&self) -> &ControlPlane {
        &self.control
    }

    /// Enqueue a task. Returns as soon as the broker holds the message.
    ///
    /// The PENDING record is written first, so a status query right after
    /// submit never reports NOT_FOUND. Unknown task names are only detected
    /// when a worker picks the message up.
    pub async fn submit(&self, task: NewTask) -> Result<TaskId> {
        let message = task.into_message(Utc::now());
        self.store.insert_pending(&message).await?;
        self.broker.publish(&message).await?;

        metrics::tasks_submitted().add(
            1,
            &[
                KeyValue::new("task", message.name.clone()),
                KeyValue::new("queue", message.queue.clone()),
            ],
        );
        info!(
            task_id = %message.id,
            task = %message.name,
            queue = %message.queue,
            eta = ?message.headers.eta,
            "task submitted"
        );
        Ok(message.id)
    }

    pub async fn get_status(&self, id: TaskId) -> Result<TaskStatus> {
        Ok(match self.store.get(id).await? {
            Some(record) => TaskStatus::Known(Box::new(record)),
            None => TaskStatus::NotFound { task_id: id },
        })
    }

    /// Most recently updated records, optionally in one state.
    pub async fn list(&self, state: Option<State>, limit: usize) -> Result<Vec<TaskRecord>> {
        self.store.list(state, limit).await
    }

    pub async fn revoke(&self, id: TaskId, terminate: bool) -> Result<RevokeAck> {
        self.control.revoke(id, terminate).await
    }

    /// Ids running on each worker that answered in time.
    pub async fn list_active(&self) -> Result<HashMap<String, Vec<TaskId>>> {
        let active = self.control.inspect_active().await?;
        Ok(active
            .into_iter()
            .map(|(worker, tasks)| (worker, tasks.into_iter().map(|t| t.task_id).collect()))
            .collect())
    }

    pub async fn stats(&self) -> Result<HashMap<String, WorkerStats>> {
        self.control.inspect_stats().await
    }

    /// Remove expired records now instead of waiting for a worker to.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.store.purge_expired().await
    }
}
