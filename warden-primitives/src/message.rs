//! Queued telemetry and command messages.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classes of messages moving between the agent and the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Idempotent state snapshots the server may deduplicate.
    Stateful,
    /// Events delivered at least once.
    Stateless,
    /// Server-issued directives awaiting dispatch.
    Command,
    /// Terminal outcomes of dispatched commands.
    CommandResult,
}

impl MessageType {
    /// All message types, in a stable order.
    pub const ALL: [Self; 4] = [
        Self::Stateful,
        Self::Stateless,
        Self::Command,
        Self::CommandResult,
    ];

    /// Returns the canonical lowercase name used for storage families.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stateful => "stateful",
            Self::Stateless => "stateless",
            Self::Command => "command",
            Self::CommandResult => "command_result",
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of work held by the persistent queue.
///
/// `data` is either a single JSON value or an array of JSON-encoded strings;
/// a message never changes type once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    message_type: MessageType,
    data: Value,
    #[serde(default)]
    module: String,
    #[serde(default)]
    module_type: String,
    #[serde(default)]
    metadata: String,
}

impl Message {
    /// Creates a message of the given type carrying `data`.
    #[must_use]
    pub fn new(message_type: MessageType, data: Value) -> Self {
        Self {
            message_type,
            data,
            module: String::new(),
            module_type: String::new(),
            metadata: String::new(),
        }
    }

    /// Tags the message with its producing module and sub-type.
    #[must_use]
    pub fn with_origin(mut self, module: impl Into<String>, module_type: impl Into<String>) -> Self {
        self.module = module.into();
        self.module_type = module_type.into();
        self
    }

    /// Attaches opaque producer metadata (a JSON string).
    #[must_use]
    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    /// Returns the message type.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Returns the carried data.
    #[must_use]
    pub const fn data(&self) -> &Value {
        &self.data
    }

    /// Returns the producing module tag (may be empty).
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Returns the module sub-type tag (may be empty).
    #[must_use]
    pub fn module_type(&self) -> &str {
        &self.module_type
    }

    /// Returns the producer metadata string (may be empty).
    #[must_use]
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Flattens the payload into the JSON-encoded strings sent upstream.
    ///
    /// Array payloads yield one string per element; a single value yields
    /// one string. String elements are passed through untouched so already
    /// encoded events are not double-escaped.
    #[must_use]
    pub fn data_strings(&self) -> Vec<String> {
        match &self.data {
            Value::Array(items) => items.iter().map(element_string).collect(),
            other => vec![element_string(other)],
        }
    }
}

fn element_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_names_are_stable() {
        assert_eq!(MessageType::Stateful.as_str(), "stateful");
        assert_eq!(MessageType::CommandResult.as_str(), "command_result");
        assert_eq!(MessageType::ALL.len(), 4);
    }

    #[test]
    fn round_trips_through_json() {
        let message = Message::new(MessageType::Stateless, json!({"event": "boot"}))
            .with_origin("logcollector", "file")
            .with_metadata(r#"{"module":"logcollector"}"#);

        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn data_strings_flatten_arrays() {
        let message = Message::new(
            MessageType::Stateless,
            json!([r#"{"event":1}"#, r#"{"event":2}"#]),
        );
        assert_eq!(
            message.data_strings(),
            vec![r#"{"event":1}"#.to_owned(), r#"{"event":2}"#.to_owned()]
        );

        let single = Message::new(MessageType::Stateful, json!({"disk": "full"}));
        assert_eq!(single.data_strings(), vec![r#"{"disk":"full"}"#.to_owned()]);
    }
}
