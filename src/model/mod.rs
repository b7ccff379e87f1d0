//! Core data model.
//!
//! A task is a named unit of work with arguments. Its message travels
//! through the broker; its record tracks lifecycle state in the store.

pub mod payload;
pub mod task;
pub mod worker;

pub use payload::{PayloadError, TaskPayload};
pub use task::*;
pub use worker::{ActiveTask, WorkerStats};
