//! Worker: consumes task queues and executes handlers.
//!
//! A worker runs `concurrency` slots. Each slot holds at most one unacked
//! message at a time (prefetch of one), so a crash loses no more than what
//! is in flight and the broker re-delivers it after the visibility timeout.
//! Alongside the slots the worker answers control commands and purges
//! expired records.

mod execution;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerClient, ControlStream};
use crate::control::{ControlCommand, ControlMessage, ControlReply};
use crate::error::{Error, Result};
use crate::model::{ActiveTask, DEFAULT_QUEUE, TaskId, WorkerStats};
use crate::registry::TaskRegistry;
use crate::retry::RetryManager;
use crate::store::{DEFAULT_RESULT_EXPIRES, TaskStore};

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity reported to the control plane. Unique per process.
    pub worker_id: String,
    /// Queues consumed, polled round-robin.
    pub queues: Vec<String>,
    /// Number of tasks executed at once.
    pub concurrency: usize,
    /// Handler is asked to wrap up after this long.
    pub soft_time_limit: Duration,
    /// Handler is stopped after this long.
    pub hard_time_limit: Duration,
    /// Added to the longest hard limit to form the visibility timeout.
    pub visibility_grace: Duration,
    /// Sleep between polls when every queue is empty.
    pub poll_interval: Duration,
    /// How often expired records are purged.
    pub housekeeping_interval: Duration,
    /// How long a revoked id is remembered locally.
    pub revoke_memory: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            queues: vec![DEFAULT_QUEUE.to_string()],
            concurrency: 4,
            soft_time_limit: Duration::from_secs(1500),
            hard_time_limit: Duration::from_secs(1800),
            visibility_grace: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            housekeeping_interval: Duration::from_secs(60),
            revoke_memory: DEFAULT_RESULT_EXPIRES,
        }
    }
}

/// `worker-<pid>-<random>`, unique enough across a cluster.
pub fn default_worker_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}", std::process::id(), &suffix[..8])
}

struct Running {
    terminate: CancellationToken,
    active: ActiveTask,
}

struct WorkerInner {
    config: WorkerConfig,
    broker: BrokerClient,
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    retry: RetryManager,
    visibility_timeout: Duration,
    shutdown: CancellationToken,
    running: Mutex<HashMap<TaskId, Running>>,
    revoked: Mutex<HashMap<TaskId, Instant>>,
    processed: Mutex<BTreeMap<String, u64>>,
    started_at: DateTime<Utc>,
}

/// Cheap to clone; clones share one worker.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        broker: BrokerClient,
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        let longest_hard_limit = registry
            .names()
            .into_iter()
            .filter_map(|name| registry.get(name).ok())
            .filter_map(|task| task.options.hard_time_limit)
            .fold(config.hard_time_limit, Duration::max);
        let visibility_timeout = longest_hard_limit + config.visibility_grace;

        Self {
            inner: Arc::new(WorkerInner {
                retry: RetryManager::new(broker.clone(), Arc::clone(&store)),
                config,
                broker,
                store,
                registry,
                visibility_timeout,
                shutdown: CancellationToken::new(),
                running: Mutex::new(HashMap::new()),
                revoked: Mutex::new(HashMap::new()),
                processed: Mutex::new(BTreeMap::new()),
                started_at: Utc::now(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.config.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// How long a fetched message stays hidden from other workers.
    pub fn visibility_timeout(&self) -> Duration {
        self.inner.visibility_timeout
    }

    /// Stop fetching. Tasks already running are finished and acked first.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Run until shutdown, or until the broker stays unreachable past the
    /// reconnect budget.
    pub async fn run(&self) -> Result<()> {
        if self.inner.config.queues.is_empty() {
            return Err(Error::Config("worker has no queues to consume".into()));
        }
        let control = self.inner.broker.subscribe_control().await?;

        info!(
            worker_id = %self.id(),
            queues = ?self.inner.config.queues,
            concurrency = self.inner.config.concurrency,
            tasks = ?self.inner.registry.names(),
            visibility_secs = self.inner.visibility_timeout.as_secs(),
            "worker started"
        );

        let control_task = tokio::spawn(self.clone().control_loop(control));
        let housekeeping = tokio::spawn(self.clone().housekeeping_loop());

        let mut slots = JoinSet::new();
        for slot in 0..self.inner.config.concurrency.max(1) {
            let worker = self.clone();
            slots.spawn(async move { worker.slot_loop(slot).await });
        }

        let mut result = Ok(());
        while let Some(joined) = slots.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => Err(Error::Other(format!("worker slot panicked: {e}"))),
            };
            if let Err(e) = outcome {
                error!(worker_id = %self.id(), error = %e, "worker slot stopped, shutting down");
                self.shutdown();
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        self.shutdown();
        control_task.abort();
        housekeeping.abort();
        info!(worker_id = %self.id(), "worker stopped");
        result
    }

    /// Fetch and process one message at a time, round-robin over queues.
    async fn slot_loop(&self, slot: usize) -> Result<()> {
        let queues = &self.inner.config.queues;
        let mut next = slot % queues.len();

        while !self.inner.shutdown.is_cancelled() {
            let mut delivered = false;
            for offset in 0..queues.len() {
                let index = (next + offset) % queues.len();
                let fetched = self
                    .inner
                    .broker
                    .fetch(&queues[index], self.inner.visibility_timeout)
                    .await;
                match fetched {
                    Ok(Some(delivery)) => {
                        next = (index + 1) % queues.len();
                        delivered = true;
                        match self.process(delivery).await {
                            Ok(()) => {}
                            Err(e @ Error::BrokerUnavailable { .. }) => return Err(e),
                            Err(e) => {
                                error!(slot, error = %e, "delivery left for redelivery");
                            }
                        }
                        break;
                    }
                    Ok(None) => {}
                    Err(e @ Error::BrokerUnavailable { .. }) => return Err(e),
                    Err(e) => warn!(slot, queue = %queues[index], error = %e, "fetch failed"),
                }
            }

            if !delivered {
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
                }
            }
        }
        debug!(slot, "slot stopped");
        Ok(())
    }

    async fn control_loop(self, mut commands: ControlStream) {
        loop {
            let message = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                message = commands.recv() => message,
            };
            let Some(message) = message else {
                warn!(worker_id = %self.id(), "control subscription closed");
                return;
            };
            if !message.addresses(self.id()) {
                continue;
            }
            let ControlMessage::Command {
                reply_to, command, ..
            } = message
            else {
                continue;
            };

            let reply = self.handle_command(command);
            let reply = ControlMessage::Reply {
                reply_to,
                worker_id: self.id().to_string(),
                reply,
            };
            if let Err(e) = self.inner.broker.broadcast(&reply).await {
                warn!(worker_id = %self.id(), error = %e, "failed to send control reply");
            }
        }
    }

    /// Answer one control command from local state.
    pub fn handle_command(&self, command: ControlCommand) -> ControlReply {
        debug!(worker_id = %self.id(), ?command, "control command");
        match command {
            ControlCommand::Revoke { task_id, terminate } => ControlReply::Revoked {
                task_id,
                terminated: self.revoke_local(task_id, terminate),
            },
            ControlCommand::InspectActive => ControlReply::Active {
                tasks: self.active_tasks(),
            },
            ControlCommand::InspectStats => ControlReply::Stats {
                stats: self.stats(),
            },
            ControlCommand::Ping => ControlReply::Pong,
        }
    }

    /// Remember `task_id` as revoked. With `terminate`, stop it if it is
    /// running here. Returns whether a running execution was stopped.
    pub fn revoke_local(&self, task_id: TaskId, terminate: bool) -> bool {
        self.inner.revoked.lock().insert(task_id, Instant::now());
        if !terminate {
            return false;
        }
        match self.inner.running.lock().get(&task_id) {
            Some(running) => {
                info!(%task_id, worker_id = %self.id(), "terminating running task");
                running.terminate.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_revoked(&self, task_id: TaskId) -> bool {
        self.inner.revoked.lock().contains_key(&task_id)
    }

    pub fn active_tasks(&self) -> Vec<ActiveTask> {
        let mut tasks: Vec<ActiveTask> = self
            .inner
            .running
            .lock()
            .values()
            .map(|r| r.active.clone())
            .collect();
        tasks.sort_by_key(|t| t.started_at);
        tasks
    }

    pub fn stats(&self) -> WorkerStats {
        let now = Utc::now();
        let mut in_flight: Vec<TaskId> = self.inner.running.lock().keys().copied().collect();
        in_flight.sort();
        WorkerStats {
            worker_id: self.id().to_string(),
            queues: self.inner.config.queues.clone(),
            concurrency: self.inner.config.concurrency,
            in_flight,
            processed: self.inner.processed.lock().clone(),
            started_at: self.inner.started_at,
            uptime_secs: (now - self.inner.started_at).num_seconds().max(0) as u64,
            pid: std::process::id(),
        }
    }

    async fn housekeeping_loop(self) {
        let mut interval = tokio::time::interval(self.inner.config.housekeeping_interval);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }
            match self.inner.store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "purged expired task records"),
                Err(e) => warn!(error = %e, "failed to purge expired records"),
            }
            let memory = self.inner.config.revoke_memory;
            self.inner
                .revoked
                .lock()
                .retain(|_, at| at.elapsed() < memory);
        }
    }

    fn track(&self, task_id: TaskId, active: ActiveTask) -> CancellationToken {
        let terminate = CancellationToken::new();
        self.inner.running.lock().insert(
            task_id,
            Running {
                terminate: terminate.clone(),
                active,
            },
        );
        terminate
    }

    fn untrack(&self, task_id: TaskId, name: &str) {
        self.inner.running.lock().remove(&task_id);
        *self
            .inner
            .processed
            .lock()
            .entry(name.to_string())
            .or_default() += 1;
    }
}
