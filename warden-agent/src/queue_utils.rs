//! Glue between the durable queue and the wire formats.

use serde_json::Value;
use tracing::{error, warn};

use warden_primitives::{CommandEntry, Message, MessageType};
use warden_queue::{MultiTypeQueue, QueueResult};

/// Upper bound on messages pulled per batch before the byte budget is
/// applied.
const BATCH_FETCH_LIMIT: usize = 256;

/// Drains a batch of one message type into the upload body.
///
/// Suspends until at least one message is pending. The body is three
/// newline-separated parts: the agent metadata (may be empty), the module
/// metadata of the first drained message, and the JSON array of data
/// strings. Messages are added oldest first until their payloads exceed
/// `max_bytes` (always at least one).
///
/// Returns the body and the number of messages it covers, which is the
/// count to pop once the server acknowledges the upload.
pub async fn get_messages_from_queue(
    queue: &MultiTypeQueue,
    message_type: MessageType,
    max_bytes: usize,
    agent_metadata: Option<String>,
) -> (String, usize) {
    let candidates = queue
        .get_next_n(message_type, BATCH_FETCH_LIMIT, "", "")
        .await;

    let mut data_strings = Vec::new();
    let mut taken = 0;
    let mut used_bytes = 0;
    for message in &candidates {
        let strings = message.data_strings();
        let size: usize = strings.iter().map(String::len).sum();
        if taken > 0 && used_bytes + size > max_bytes {
            break;
        }
        used_bytes += size;
        taken += 1;
        data_strings.extend(strings);
    }

    let module_metadata = candidates
        .first()
        .map(|message| message.metadata().to_owned())
        .unwrap_or_default();

    let body = format!(
        "{}\n{}\n{}",
        agent_metadata.unwrap_or_default(),
        module_metadata,
        Value::from(data_strings)
    );

    (body, taken)
}

/// Decodes a `GET /commands` reply and enqueues each command.
///
/// A reply without a `commands` array enqueues nothing.
///
/// # Errors
///
/// Returns a queue error when the batch cannot be made durable.
pub async fn push_commands_to_queue(queue: &MultiTypeQueue, response: &str) -> QueueResult<()> {
    let parsed: Value = match serde_json::from_str(response) {
        Ok(value) => value,
        Err(err) => {
            warn!(%err, "discarding undecodable commands reply");
            return Ok(());
        }
    };

    let Some(commands) = parsed.get("commands").and_then(Value::as_array) else {
        return Ok(());
    };
    if commands.is_empty() {
        return Ok(());
    }

    let messages: Vec<Message> = commands
        .iter()
        .map(|command| Message::new(MessageType::Command, command.clone()))
        .collect();
    queue.push_batch(messages).await
}

/// Pulls the next command entry without waiting.
///
/// Returns `None` when the lane is empty. An undecodable record is logged,
/// popped and skipped so it cannot wedge the loop.
pub async fn get_command_from_queue(queue: &MultiTypeQueue) -> Option<CommandEntry> {
    if queue.is_empty(MessageType::Command, "").await {
        return None;
    }

    let message = queue.get_next(MessageType::Command, "").await;
    match CommandEntry::from_queue_payload(message.data()) {
        Ok(entry) => Some(entry),
        Err(err) => {
            error!(%err, "discarding malformed command entry");
            if let Err(err) = queue.pop_n(MessageType::Command, 1, "").await {
                error!(%err, "could not discard malformed command entry");
            }
            None
        }
    }
}

/// Enqueues the terminal entry of a dispatched command as a command
/// result.
pub async fn report_command_result(queue: &MultiTypeQueue, entry: &CommandEntry) {
    let message = Message::new(
        MessageType::CommandResult,
        serde_json::json!({
            "id": entry.id,
            "module": entry.module,
            "command": entry.command,
            "result": entry.execution_result,
        }),
    );
    if let Err(err) = queue.push(message).await {
        error!(%err, id = %entry.id, "could not enqueue command result");
    }
}
