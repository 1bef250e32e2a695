//! Server-issued command entries and their execution results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Routing key reserved for the configuration subsystem.
pub const CENTRALIZED_CONFIGURATION_MODULE: &str = "CentralizedConfiguration";

/// Lifecycle status of a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// No status has been recorded yet.
    Unknown,
    /// The command was pulled from the queue and is executing.
    InProgress,
    /// The target reported success.
    Success,
    /// The target reported failure, or dispatch could not reach it.
    Failure,
    /// The per-command deadline expired before the target returned.
    Timeout,
}

impl CommandStatus {
    /// Returns `true` once the command can no longer change status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Timeout)
    }
}

/// Outcome reported by a command target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Current lifecycle status.
    pub status: CommandStatus,
    /// Human-readable detail accompanying the status.
    pub message: String,
}

impl CommandResult {
    /// Creates a result with the given status and detail message.
    #[must_use]
    pub fn new(status: CommandStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Shorthand for a successful result.
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self::new(CommandStatus::Success, message)
    }

    /// Shorthand for a failed result.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(CommandStatus::Failure, message)
    }
}

/// A decoded command record pulled from the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEntry {
    /// Server-assigned opaque identifier, unique per command.
    pub id: String,
    /// Routing key: a module name, or
    /// [`CENTRALIZED_CONFIGURATION_MODULE`].
    pub module: String,
    /// Command verb understood by the target.
    pub command: String,
    /// Free-form parameters forwarded to the target.
    #[serde(default)]
    pub parameters: Value,
    /// Execution outcome, written exactly once with a terminal status.
    #[serde(default = "in_progress")]
    pub execution_result: CommandResult,
}

fn in_progress() -> CommandResult {
    CommandResult::new(CommandStatus::InProgress, String::new())
}

impl CommandEntry {
    /// Decodes a command from the JSON payload the manager returned.
    ///
    /// The entry is born `InProgress`: decoding happens the instant the
    /// command is pulled for dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCommandEntry`] when `id`, `module` or
    /// `command` are missing or not strings.
    pub fn from_queue_payload(payload: &Value) -> Result<Self> {
        let field = |name: &str| -> Result<String> {
            payload
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| Error::invalid_command_entry(format!("missing field `{name}`")))
        };

        Ok(Self {
            id: field("id")?,
            module: field("module")?,
            command: field("command")?,
            parameters: payload.get("parameters").cloned().unwrap_or(Value::Null),
            execution_result: in_progress(),
        })
    }

    /// Returns `true` when the command targets the configuration subsystem.
    #[must_use]
    pub fn targets_centralized_configuration(&self) -> bool {
        self.module == CENTRALIZED_CONFIGURATION_MODULE
    }

    /// Records the terminal result for this command.
    #[must_use]
    pub fn with_result(mut self, result: CommandResult) -> Self {
        self.execution_result = result;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_and_starts_in_progress() {
        let payload = json!({
            "id": "112233",
            "module": "inventory",
            "command": "scan",
            "parameters": {"deep": true}
        });

        let entry = CommandEntry::from_queue_payload(&payload).unwrap();
        assert_eq!(entry.id, "112233");
        assert_eq!(entry.module, "inventory");
        assert_eq!(entry.command, "scan");
        assert_eq!(entry.parameters, json!({"deep": true}));
        assert_eq!(entry.execution_result.status, CommandStatus::InProgress);
    }

    #[test]
    fn missing_fields_are_rejected() {
        let payload = json!({"id": "x", "command": "scan"});
        let err = CommandEntry::from_queue_payload(&payload).expect_err("module required");
        assert!(matches!(err, Error::InvalidCommandEntry { .. }));
    }

    #[test]
    fn terminal_statuses() {
        assert!(CommandStatus::Success.is_terminal());
        assert!(CommandStatus::Timeout.is_terminal());
        assert!(!CommandStatus::InProgress.is_terminal());
        assert!(!CommandStatus::Unknown.is_terminal());
    }

    #[test]
    fn recognizes_the_configuration_pseudo_module() {
        let entry = CommandEntry::from_queue_payload(&json!({
            "id": "1",
            "module": CENTRALIZED_CONFIGURATION_MODULE,
            "command": "set-group",
        }))
        .unwrap();
        assert!(entry.targets_centralized_configuration());
    }
}
