//! Periodic scheduler ("beat").
//!
//! One tick loop per instance. Before publishing anything a tick must hold
//! the cluster-wide lease, so any number of instances may run and only the
//! holder submits jobs. An instance that loses the lease forgets its due
//! times and starts afresh if it wins the lease back.

mod schedule;

pub use schedule::{PeriodicJob, Schedule, ScheduleTable};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::BrokerClient;
use crate::error::{Error, Result};
use crate::model::TaskId;
use crate::store::{LeaseStore, TaskStore};
use crate::telemetry::metrics;

/// Name of the lease row every scheduler instance competes for.
pub const LEASE_NAME: &str = "taskq-beat";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identity used as lease holder.
    pub instance_id: String,
    pub tick_interval: Duration,
    /// Lease lifetime. Must exceed the tick interval, or the lease lapses
    /// between renewals.
    pub lease_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("beat-{}", Uuid::new_v4().simple()),
            tick_interval: Duration::from_secs(1),
            lease_ttl: Duration::from_secs(5),
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    table: ScheduleTable,
    broker: BrokerClient,
    store: Arc<dyn TaskStore>,
    lease: Arc<dyn LeaseStore>,
    next_due: HashMap<String, DateTime<Utc>>,
    leader: bool,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        table: ScheduleTable,
        broker: BrokerClient,
        store: Arc<dyn TaskStore>,
        lease: Arc<dyn LeaseStore>,
    ) -> Self {
        Self {
            config,
            table,
            broker,
            store,
            lease,
            next_due: HashMap::new(),
            leader: false,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Tick until `shutdown` fires, then release the lease.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            instance = %self.config.instance_id,
            jobs = self.table.len(),
            tick_ms = self.config.tick_interval.as_millis() as u64,
            "scheduler started"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.tick(Utc::now()).await {
                Ok(_) => {}
                Err(e @ Error::BrokerUnavailable { .. }) => {
                    self.release().await;
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "scheduler tick failed"),
            }
        }

        self.release().await;
        info!(instance = %self.config.instance_id, "scheduler stopped");
        Ok(())
    }

    /// One pass: take or renew the lease, then submit whatever is due.
    ///
    /// Returns the ids submitted.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<Vec<TaskId>> {
        let acquired = match self
            .lease
            .acquire_lease(LEASE_NAME, &self.config.instance_id, self.config.lease_ttl)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                self.step_down();
                return Err(e);
            }
        };
        if !acquired {
            self.step_down();
            return Ok(Vec::new());
        }
        if !self.leader {
            info!(instance = %self.config.instance_id, "scheduler lease acquired");
            self.leader = true;
        }

        let mut submitted = Vec::new();
        for job in self.table.jobs() {
            let due = match self.next_due.get(&job.name) {
                Some(due) => *due,
                None => {
                    if let Some(first) = job.schedule.first_after(now) {
                        debug!(job = %job.name, %first, "job scheduled");
                        self.next_due.insert(job.name.clone(), first);
                    }
                    continue;
                }
            };
            if due > now {
                continue;
            }

            let message = job.new_task().into_message(now);
            self.store.insert_pending(&message).await?;
            self.broker.publish(&message).await?;
            metrics::scheduler_published().add(1, &[KeyValue::new("job", job.name.clone())]);
            metrics::tasks_submitted().add(
                1,
                &[
                    KeyValue::new("task", job.task_name.clone()),
                    KeyValue::new("queue", job.queue.clone()),
                ],
            );
            info!(job = %job.name, task = %job.task_name, task_id = %message.id, "periodic task published");
            submitted.push(message.id);

            match job.schedule.next_after(due, now) {
                Some(next) => {
                    self.next_due.insert(job.name.clone(), next);
                }
                None => {
                    self.next_due.remove(&job.name);
                }
            }
        }
        Ok(submitted)
    }

    fn step_down(&mut self) {
        if self.leader {
            info!(instance = %self.config.instance_id, "scheduler lease lost");
        }
        self.leader = false;
        self.next_due.clear();
    }

    async fn release(&mut self) {
        if !self.leader {
            return;
        }
        if let Err(e) = self
            .lease
            .release_lease(LEASE_NAME, &self.config.instance_id)
            .await
        {
            warn!(error = %e, "failed to release scheduler lease");
        }
        self.step_down();
    }
}
