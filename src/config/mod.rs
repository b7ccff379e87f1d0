//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. Sensitive values wrapped in secrecy::SecretString to prevent
//! log leaks.

pub mod secrets;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};
use crate::model::DEFAULT_QUEUE;
use crate::store::DEFAULT_RESULT_EXPIRES;
use crate::worker::{WorkerConfig, default_worker_id};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Tasks executed at once per worker.
    pub concurrency: usize,
    /// Queues a worker consumes.
    pub queues: Vec<String>,
    pub soft_time_limit: Duration,
    pub hard_time_limit: Duration,
    /// Lifetime of a task record after its last transition.
    pub result_expires: Duration,
    /// Reconnect attempts before the broker counts as unavailable.
    pub broker_max_retries: u32,
    pub worker_name: Option<String>,
    /// TOML file of periodic jobs for `taskq beat`.
    pub schedule_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let concurrency = parse_or(&var, "TASKQ_CONCURRENCY", default_concurrency())?;
        if concurrency == 0 {
            return Err(Error::Config("TASKQ_CONCURRENCY must be at least 1".into()));
        }

        let queues: Vec<String> = match var("TASKQ_QUEUES") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(String::from)
                .collect(),
            None => vec![DEFAULT_QUEUE.to_string()],
        };
        if queues.is_empty() {
            return Err(Error::Config("TASKQ_QUEUES names no queue".into()));
        }

        let soft_time_limit = seconds_or(&var, "TASKQ_SOFT_TIME_LIMIT", 1500)?;
        let hard_time_limit = seconds_or(&var, "TASKQ_HARD_TIME_LIMIT", 1800)?;
        if soft_time_limit > hard_time_limit {
            return Err(Error::Config(
                "TASKQ_SOFT_TIME_LIMIT must not exceed TASKQ_HARD_TIME_LIMIT".into(),
            ));
        }

        Ok(Self {
            database_url: SecretString::from(
                var("DATABASE_URL").ok_or_else(|| missing("DATABASE_URL"))?,
            ),
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            concurrency,
            queues,
            soft_time_limit,
            hard_time_limit,
            result_expires: seconds_or(
                &var,
                "TASKQ_RESULT_EXPIRES",
                DEFAULT_RESULT_EXPIRES.as_secs(),
            )?,
            broker_max_retries: parse_or(
                &var,
                "TASKQ_BROKER_MAX_RETRIES",
                BackoffPolicy::STANDARD.max_retries,
            )?,
            worker_name: var("TASKQ_WORKER_NAME"),
            schedule_path: var("TASKQ_SCHEDULE").map(PathBuf::from),
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::STANDARD.with_max_retries(self.broker_max_retries)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            worker_id: self.worker_name.clone().unwrap_or_else(default_worker_id),
            queues: self.queues.clone(),
            concurrency: self.concurrency,
            soft_time_limit: self.soft_time_limit,
            hard_time_limit: self.hard_time_limit,
            revoke_memory: self.result_expires,
            ..WorkerConfig::default()
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get())
}

fn missing(name: &str) -> Error {
    Error::Config(format!("required environment variable {name} is not set"))
}

fn parse_or<T, V>(var: &V, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}: invalid value `{raw}`: {e}"))),
        None => Ok(default),
    }
}

fn seconds_or<V>(var: &V, name: &str, default: u64) -> Result<Duration>
where
    V: Fn(&str) -> Option<String>,
{
    parse_or(var, name, default).map(Duration::from_secs)
}
