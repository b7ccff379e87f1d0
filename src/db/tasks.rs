//! Task records and scheduler leases on Postgres.
//!
//! Transitions are one conditional `UPDATE … WHERE state = ANY(sources)`,
//! so concurrent workers never overwrite each other's state.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{RecordPatch, State, TaskError, TaskId, TaskMessage, TaskRecord};
use crate::store::{LeaseStore, TaskStore};

const RECORD_COLUMNS: &str = "id, name, queue, state, progress, result, error, retries, \
     max_retries, attempts, worker_id, created_at, updated_at, expires_at";

impl super::Db {
    fn expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.result_expires)
            .unwrap_or_else(|_| chrono::Duration::hours(1))
    }
}

#[async_trait]
impl TaskStore for super::Db {
    async fn insert_pending(&self, message: &TaskMessage) -> Result<bool> {
        let now = Utc::now();
        // An expired record with the same id is replaced; a live one wins.
        let inserted = sqlx::query(
            "INSERT INTO tasks (id, name, queue, state, retries, max_retries, attempts, created_at, updated_at, expires_at)
             VALUES ($1, $2, $3, 'PENDING', $4, $5, 0, $6, $6, $7)
             ON CONFLICT (id) DO UPDATE SET
                 name = EXCLUDED.name, queue = EXCLUDED.queue, state = 'PENDING',
                 progress = NULL, result = NULL, error = NULL,
                 retries = EXCLUDED.retries, max_retries = EXCLUDED.max_retries,
                 attempts = 0, worker_id = NULL,
                 created_at = EXCLUDED.created_at, updated_at = EXCLUDED.updated_at,
                 expires_at = EXCLUDED.expires_at
             WHERE tasks.expires_at <= $6",
        )
        .bind(message.id.0)
        .bind(&message.name)
        .bind(&message.queue)
        .bind(message.headers.retries as i32)
        .bind(message.headers.max_retries.map(|n| n as i32))
        .bind(now)
        .bind(self.expiry(now))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted == 1)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM tasks WHERE id = $1 AND expires_at > $2"
        ))
        .bind(id.0)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskRow::try_into_record).transpose()
    }

    async fn transition(&self, id: TaskId, to: State, patch: RecordPatch) -> Result<TaskRecord> {
        let now = Utc::now();
        let sources: Vec<String> = State::sources_of(to)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let result = if to == State::Success { patch.result } else { None };
        let error = if to == State::Failure {
            patch.error.map(Json)
        } else {
            None
        };
        let attempts_increment = if to == State::Started { 1 } else { 0 };

        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "UPDATE tasks SET
                 state = $2,
                 progress = COALESCE($3, progress),
                 result = $4,
                 error = $5,
                 worker_id = COALESCE($6, worker_id),
                 retries = COALESCE($7, retries),
                 max_retries = COALESCE($8, max_retries),
                 attempts = attempts + $9,
                 updated_at = $10,
                 expires_at = $11
             WHERE id = $1 AND state = ANY($12) AND expires_at > $10
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(id.0)
        .bind(to.as_str())
        .bind(patch.progress)
        .bind(result)
        .bind(error)
        .bind(patch.worker_id)
        .bind(patch.retries.map(|n| n as i32))
        .bind(patch.max_retries.map(|n| n as i32))
        .bind(attempts_increment)
        .bind(now)
        .bind(self.expiry(now))
        .bind(&sources)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return row.try_into_record();
        }

        // Nothing matched: either the record is gone or its state forbids `to`.
        let current: Option<(String,)> =
            sqlx::query_as("SELECT state FROM tasks WHERE id = $1 AND expires_at > $2")
                .bind(id.0)
                .bind(now)
                .fetch_optional(&self.pool)
                .await?;
        match current {
            Some((state,)) => Err(Error::InvalidTransition {
                from: state.parse()?,
                to,
            }),
            None => Err(Error::NotFound(id.to_string())),
        }
    }

    async fn list(&self, state: Option<State>, limit: usize) -> Result<Vec<TaskRecord>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM tasks
             WHERE expires_at > $1 AND ($2::text IS NULL OR state = $2)
             ORDER BY updated_at DESC
             LIMIT $3"
        ))
        .bind(Utc::now())
        .bind(state.map(State::as_str))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::try_into_record).collect()
    }

    async fn purge_expired(&self) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM tasks WHERE expires_at <= $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(purged)
    }
}

#[async_trait]
impl LeaseStore for super::Db {
    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        // Lease times use the database clock so instances on different
        // hosts agree on expiry.
        let acquired = sqlx::query(
            "INSERT INTO scheduler_leases (name, holder, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))
             ON CONFLICT (name) DO UPDATE SET
                 holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
             WHERE scheduler_leases.holder = EXCLUDED.holder
                OR scheduler_leases.expires_at <= now()",
        )
        .bind(name)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(acquired == 1)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM scheduler_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    name: String,
    queue: String,
    state: String,
    progress: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
    error: Option<Json<TaskError>>,
    retries: i32,
    max_retries: Option<i32>,
    attempts: i32,
    worker_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TaskRow {
    fn try_into_record(self) -> Result<TaskRecord> {
        Ok(TaskRecord {
            id: TaskId(self.id),
            name: self.name,
            queue: self.queue,
            state: self.state.parse()?,
            progress: self.progress,
            result: self.result,
            error: self.error.map(|Json(e)| e),
            retries: self.retries.max(0) as u32,
            max_retries: self.max_retries.map(|n| n.max(0) as u32),
            attempts: self.attempts.max(0) as u32,
            worker_id: self.worker_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
        })
    }
}
