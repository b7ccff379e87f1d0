//! Control-plane wire format.
//!
//! Commands and replies share one broadcast channel. Every command carries
//! a fresh `reply_to` id and only replies quoting it are collected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ActiveTask, TaskId, WorkerStats};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Forget about a task; with `terminate`, also stop it if running.
    Revoke { task_id: TaskId, terminate: bool },
    InspectActive,
    InspectStats,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ControlReply {
    Revoked { task_id: TaskId, terminated: bool },
    Active { tasks: Vec<ActiveTask> },
    Stats { stats: WorkerStats },
    Pong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Command {
        reply_to: Uuid,
        /// Worker ids to address. None means every worker.
        #[serde(default)]
        destination: Option<Vec<String>>,
        command: ControlCommand,
    },
    Reply {
        reply_to: Uuid,
        worker_id: String,
        reply: ControlReply,
    },
}

impl ControlMessage {
    /// Whether a command is meant for `worker_id`.
    pub fn addresses(&self, worker_id: &str) -> bool {
        match self {
            ControlMessage::Command { destination, .. } => destination
                .as_ref()
                .is_none_or(|ids| ids.iter().any(|id| id == worker_id)),
            ControlMessage::Reply { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_tagged() {
        let msg = ControlMessage::Command {
            reply_to: Uuid::nil(),
            destination: None,
            command: ControlCommand::Revoke {
                task_id: TaskId(Uuid::nil()),
                terminate: true,
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "command");
        assert_eq!(json["command"]["command"], "revoke");
        assert_eq!(json["command"]["terminate"], true);

        let back: ControlMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn destination_filters_workers() {
        let msg = ControlMessage::Command {
            reply_to: Uuid::new_v4(),
            destination: Some(vec!["w1".into()]),
            command: ControlCommand::Ping,
        };
        assert!(msg.addresses("w1"));
        assert!(!msg.addresses("w2"));
    }
}
