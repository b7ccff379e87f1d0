//! Postgres backend: connection pool, migrations, and health check.
//!
//! One [`Db`] implements every seam: the broker on pgmq queues
//! ([`pgmq`]), the lifecycle store and scheduler lease on plain tables
//! ([`tasks`]), and the control channel on `LISTEN/NOTIFY` ([`control`]).

pub mod control;
pub mod pgmq;
pub mod tasks;

use std::collections::HashSet;
use std::time::Duration;

use parking_lot::Mutex;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::{Error, Result};
use crate::store::DEFAULT_RESULT_EXPIRES;

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
    result_expires: Duration,
    /// pgmq queues known to exist.
    queues: Mutex<HashSet<String>>,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            result_expires: DEFAULT_RESULT_EXPIRES,
            queues: Mutex::new(HashSet::new()),
        }
    }

    /// How long records live after their last transition.
    pub fn with_result_expires(mut self, result_expires: Duration) -> Self {
        self.result_expires = result_expires;
        self
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
