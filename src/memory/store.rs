//! In-process lifecycle store and lease.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::model::{RecordPatch, State, TaskId, TaskMessage, TaskRecord};
use crate::store::{DEFAULT_RESULT_EXPIRES, LeaseStore, TaskStore};

struct Lease {
    holder: String,
    expires_at: Instant,
}

pub struct MemoryStore {
    records: Mutex<HashMap<TaskId, TaskRecord>>,
    leases: Mutex<HashMap<String, Lease>>,
    result_expires: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_result_expires(DEFAULT_RESULT_EXPIRES)
    }

    pub fn with_result_expires(result_expires: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            result_expires,
        }
    }

    /// Records held, expired ones included.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_pending(&self, message: &TaskMessage) -> Result<bool> {
        let now = Utc::now();
        let mut records = self.records.lock();
        if records.get(&message.id).is_some_and(|r| !r.is_expired(now)) {
            return Ok(false);
        }
        records.insert(
            message.id,
            TaskRecord::pending(message, now, self.result_expires),
        );
        Ok(true)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        let now = Utc::now();
        let records = self.records.lock();
        Ok(records.get(&id).filter(|r| !r.is_expired(now)).cloned())
    }

    async fn transition(&self, id: TaskId, to: State, patch: RecordPatch) -> Result<TaskRecord> {
        let now = Utc::now();
        let mut records = self.records.lock();
        let record = records
            .get_mut(&id)
            .filter(|r| !r.is_expired(now))
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if !record.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: record.state,
                to,
            });
        }
        record.apply(to, patch, now, self.result_expires);
        Ok(record.clone())
    }

    async fn list(&self, state: Option<State>, limit: usize) -> Result<Vec<TaskRecord>> {
        let now = Utc::now();
        let records = self.records.lock();
        let mut matching: Vec<TaskRecord> = records
            .values()
            .filter(|r| !r.is_expired(now))
            .filter(|r| state.is_none_or(|s| r.state == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        match leases.get_mut(name) {
            Some(lease) if lease.holder != holder && lease.expires_at > now => Ok(false),
            Some(lease) => {
                lease.holder = holder.to_string();
                lease.expires_at = now + ttl;
                Ok(true)
            }
            None => {
                leases.insert(
                    name.to_string(),
                    Lease {
                        holder: holder.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock();
        if leases.get(name).is_some_and(|l| l.holder == holder) {
            leases.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewTask, TaskError, TaskErrorKind};
    use serde_json::json;

    fn message() -> TaskMessage {
        NewTask::new("add_numbers").args([5, 3]).into_message(Utc::now())
    }

    #[tokio::test]
    async fn insert_pending_is_idempotent() {
        let store = MemoryStore::new();
        let msg = message();
        assert!(store.insert_pending(&msg).await.unwrap());
        assert!(!store.insert_pending(&msg).await.unwrap());
        assert_eq!(store.get(msg.id).await.unwrap().unwrap().state, State::Pending);
    }

    #[tokio::test]
    async fn transitions_follow_the_state_machine() {
        let store = MemoryStore::new();
        let msg = message();
        store.insert_pending(&msg).await.unwrap();

        store
            .transition(msg.id, State::Received, RecordPatch::received("w1", 3))
            .await
            .unwrap();
        let started = store
            .transition(msg.id, State::Started, RecordPatch::default())
            .await
            .unwrap();
        assert_eq!(started.attempts, 1);

        let err = store
            .transition(msg.id, State::Revoked, RecordPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: State::Started,
                to: State::Revoked
            }
        ));

        let done = store
            .transition(msg.id, State::Success, RecordPatch::success(json!(8)))
            .await
            .unwrap();
        assert_eq!(done.result, Some(json!(8)));

        let err = store
            .transition(
                msg.id,
                State::Failure,
                RecordPatch::failure(TaskError::new(TaskErrorKind::Handler, "late")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn expired_records_are_not_found() {
        let store = MemoryStore::with_result_expires(Duration::from_millis(20));
        let msg = message();
        store.insert_pending(&msg).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(store.get(msg.id).await.unwrap().is_none());
        let err = store
            .transition(msg.id, State::Received, RecordPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn lease_excludes_other_holders_until_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(50);
        assert!(store.acquire_lease("beat", "a", ttl).await.unwrap());
        assert!(!store.acquire_lease("beat", "b", ttl).await.unwrap());
        assert!(store.acquire_lease("beat", "a", ttl).await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.acquire_lease("beat", "b", ttl).await.unwrap());

        store.release_lease("beat", "a").await.unwrap();
        assert!(!store.acquire_lease("beat", "a", ttl).await.unwrap());
        store.release_lease("beat", "b").await.unwrap();
        assert!(store.acquire_lease("beat", "a", ttl).await.unwrap());
    }
}
