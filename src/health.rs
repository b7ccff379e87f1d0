//! Readiness probe for deployments.

use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::client::TaskClient;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Readiness {
    pub broker_ok: bool,
    pub broker_error: Option<String>,
    /// Workers that answered a ping within the timeout.
    pub workers: Vec<String>,
}

impl Readiness {
    /// Ready when the broker answers and at least one worker does.
    pub fn is_ready(&self) -> bool {
        self.broker_ok && !self.workers.is_empty()
    }
}

/// Ping the broker, then ask workers to answer within `timeout`.
pub async fn readiness(client: &TaskClient, timeout: Duration) -> Readiness {
    if let Err(e) = client.broker().ping().await {
        warn!(error = %e, "broker ping failed");
        return Readiness {
            broker_ok: false,
            broker_error: Some(e.to_string()),
            workers: Vec::new(),
        };
    }

    let workers = match client.control().ping(timeout).await {
        Ok(workers) => workers,
        Err(e) => {
            warn!(error = %e, "worker ping failed");
            Vec::new()
        }
    };
    Readiness {
        broker_ok: true,
        broker_error: None,
        workers,
    }
}
