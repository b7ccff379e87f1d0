//! Control channel on Postgres `LISTEN/NOTIFY`.
//!
//! NOTIFY is fire-and-forget: listeners connected at the time receive it,
//! nobody else ever does. That matches broadcast semantics, since a worker
//! that starts later has no use for an earlier command.

use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::ControlStream;
use crate::control::ControlMessage;
use crate::error::Result;

/// Channel every worker and control client listens on.
pub const CONTROL_CHANNEL: &str = "taskq_control";

const CONTROL_BUFFER: usize = 256;

impl super::Db {
    pub(crate) async fn notify_control(&self, message: &ControlMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CONTROL_CHANNEL)
            .bind(&payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The LISTEN is in place before this returns.
    pub(crate) async fn listen_control(&self) -> Result<ControlStream> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CONTROL_CHANNEL).await?;

        let (tx, rx) = mpsc::channel(CONTROL_BUFFER);
        tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    _ = tx.closed() => break,
                    notification = listener.recv() => notification,
                };
                match notification {
                    Ok(n) => match serde_json::from_str::<ControlMessage>(n.payload()) {
                        Ok(message) => {
                            if tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "ignoring malformed control message"),
                    },
                    // PgListener reconnects on the next recv.
                    Err(e) => {
                        warn!(error = %e, "control listener error, reconnecting");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
            debug!("control listener stopped");
        });
        Ok(rx)
    }
}
