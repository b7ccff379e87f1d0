//! Task lifecycle store and scheduler lease.
//!
//! Both backends enforce the state machine inside a single atomic step, so
//! many workers may share a store without client-side locking: a transition
//! whose source state no longer matches fails with
//! [`Error::InvalidTransition`](crate::error::Error::InvalidTransition).

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{RecordPatch, State, TaskId, TaskMessage, TaskRecord};

/// Records expire this long after their last transition unless configured.
pub const DEFAULT_RESULT_EXPIRES: Duration = Duration::from_secs(3600);

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a PENDING record for `message` unless a live one exists.
    /// Returns whether a record was created.
    async fn insert_pending(&self, message: &TaskMessage) -> Result<bool>;

    /// The live record for `id`. Unknown and expired ids are `None`.
    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>>;

    /// Move a record to `to` if its current state allows it, applying
    /// `patch` in the same step.
    async fn transition(&self, id: TaskId, to: State, patch: RecordPatch) -> Result<TaskRecord>;

    /// Most recently updated live records, optionally filtered by state.
    async fn list(&self, state: Option<State>, limit: usize) -> Result<Vec<TaskRecord>>;

    /// Physically remove expired records. Returns how many went.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Cluster-wide, time-bounded mutual exclusion.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take the lease, or extend it if `holder` already owns it.
    /// Returns false while someone else holds an unexpired lease.
    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Give the lease up early. A no-op unless `holder` owns it.
    async fn release_lease(&self, name: &str, holder: &str) -> Result<()>;
}
