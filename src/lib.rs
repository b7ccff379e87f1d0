//! # taskq
//!
//! Distributed, at-least-once task execution.
//!
//! Clients submit named tasks with JSON arguments to a broker queue; workers
//! execute registered handlers under time limits, record every lifecycle
//! transition in a store, and acknowledge only once an outcome is recorded.
//! Failed tasks may be retried with a delay, a leased scheduler injects
//! periodic work, and a control plane revokes and inspects across workers.
//!
//! Production runs on Postgres (pgmq queues, a `tasks` table, LISTEN/NOTIFY);
//! the [`memory`] backends implement the same seams in-process.

pub mod backoff;
pub mod broker;
pub mod client;
pub mod config;
pub mod context;
pub mod control;
pub mod db;
pub mod error;
pub mod health;
pub mod memory;
pub mod model;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod tasks;
pub mod telemetry;
pub mod worker;

pub use broker::{Broker, BrokerClient, Delivery};
pub use client::TaskClient;
pub use context::{Outcome, TaskContext};
pub use error::{Error, Result};
pub use model::{NewTask, State, TaskId, TaskPayload, TaskStatus};
pub use registry::{TaskOptions, TaskRegistry};
pub use worker::{Worker, WorkerConfig};
