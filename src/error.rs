//! Error types for taskq.

use thiserror::Error;

use crate::model::State;

#[derive(Debug, Error)]
pub enum Error {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("broker unavailable after {attempts} attempts: {last_error}")]
    BrokerUnavailable { attempts: u32, last_error: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid schedule: {0}")]
    Schedule(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the operation may succeed if simply tried again later.
    ///
    /// Only connection-level failures qualify. Constraint violations,
    /// decode errors and the like are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Io(_) => true,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::Tls(_)
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_transient() {
        assert!(Error::Transport("connection reset".into()).is_transient());
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn logic_errors_are_permanent() {
        assert!(!Error::UnknownTask("nope".into()).is_transient());
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(
            !Error::InvalidTransition {
                from: State::Success,
                to: State::Started
            }
            .is_transient()
        );
    }
}
