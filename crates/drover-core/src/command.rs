use crate::{DroverError, DroverResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// The instruction carried by a control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// Begin processing work.
    Start,
    /// Stop processing and shut down.
    Stop,
    /// Stop, then start again.
    Restart,
    /// Apply new configuration carried in the parameters.
    Update,
    /// Temporarily stop claiming new work.
    Pause,
    /// Resume claiming work after a pause.
    Resume,
}

impl CommandKind {
    /// The canonical string form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Start => "start",
            CommandKind::Stop => "stop",
            CommandKind::Restart => "restart",
            CommandKind::Update => "update",
            CommandKind::Pause => "pause",
            CommandKind::Resume => "resume",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = DroverError;

    fn from_str(s: &str) -> DroverResult<Self> {
        match s {
            "start" => Ok(CommandKind::Start),
            "stop" => Ok(CommandKind::Stop),
            "restart" => Ok(CommandKind::Restart),
            "update" => Ok(CommandKind::Update),
            "pause" => Ok(CommandKind::Pause),
            "resume" => Ok(CommandKind::Resume),
            other => Err(DroverError::Validation(format!(
                "unknown command '{other}'"
            ))),
        }
    }
}

/// Outcome status of a control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    /// Created but not yet consumed by the target agent.
    Pending,
    /// Handled successfully. Terminal.
    Completed,
    /// The handler raised an error. Terminal.
    Failed,
}

impl CommandStatus {
    /// The canonical string form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = DroverError;

    fn from_str(s: &str) -> DroverResult<Self> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "completed" => Ok(CommandStatus::Completed),
            "failed" => Ok(CommandStatus::Failed),
            other => Err(DroverError::Validation(format!(
                "unknown command status '{other}'"
            ))),
        }
    }
}

/// A one-shot instruction pushed from a controller to a specific agent.
///
/// Consumed exactly once by the target agent's subscription handler; the
/// terminal status is always written back, success or failure — a command is
/// never silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlCommand {
    /// Unique identifier.
    pub id: Uuid,
    /// The agent this command targets.
    pub agent_id: String,
    /// The instruction to execute.
    pub command: CommandKind,
    /// Opaque parameters, interpreted only by the agent process.
    pub parameters: serde_json::Value,
    /// Outcome status.
    pub status: CommandStatus,
    /// Captured handler error, when `status` is `Failed`.
    pub error: Option<String>,
    /// When the controller created the command.
    pub created_at: DateTime<Utc>,
    /// Refreshed on the outcome write-back.
    pub updated_at: DateTime<Utc>,
}

impl ControlCommand {
    /// Creates a fresh pending command.
    pub fn new(
        agent_id: impl Into<String>,
        command: CommandKind,
        parameters: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            command,
            parameters,
            status: CommandStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_creation() {
        let cmd = ControlCommand::new("agent-1", CommandKind::Pause, json!({"drain": true}));
        assert_eq!(cmd.status, CommandStatus::Pending);
        assert_eq!(cmd.command, CommandKind::Pause);
        assert!(cmd.error.is_none());
    }

    #[test]
    fn test_command_kind_round_trip() {
        for kind in [
            CommandKind::Start,
            CommandKind::Stop,
            CommandKind::Restart,
            CommandKind::Update,
            CommandKind::Pause,
            CommandKind::Resume,
        ] {
            let parsed: CommandKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
