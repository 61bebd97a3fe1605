//! Message factories for tests.

use serde_json::{json, Value};
use tandem_protocol::{ContentMessage, MessageType, SequencedMessage};

/// A sequenced message with explicit type, client identity, and contents.
pub fn sequenced(
    sequence_number: u64,
    message_type: MessageType,
    client_id: &str,
    client_sequence_number: u64,
    contents: Option<Value>,
) -> SequencedMessage {
    SequencedMessage {
        sequence_number,
        minimum_sequence_number: 0,
        client_id: client_id.to_string(),
        client_sequence_number,
        reference_sequence_number: 0,
        message_type,
        contents,
        traces: Vec::new(),
    }
}

/// A plain operation at `sequence_number` with a small distinguishing
/// payload.
pub fn sequenced_op(sequence_number: u64, client_id: &str) -> SequencedMessage {
    sequenced(
        sequence_number,
        MessageType::Operation,
        client_id,
        sequence_number,
        Some(json!({ "op": sequence_number })),
    )
}

/// An operation envelope whose contents were split onto the content
/// channel.
pub fn envelope_without_contents(
    sequence_number: u64,
    client_id: &str,
    client_sequence_number: u64,
) -> SequencedMessage {
    sequenced(
        sequence_number,
        MessageType::Operation,
        client_id,
        client_sequence_number,
        None,
    )
}

/// A content chunk for `(client_id, client_sequence_number)`.
pub fn content(client_id: &str, client_sequence_number: u64, payload: &str) -> ContentMessage {
    ContentMessage {
        client_id: client_id.to_string(),
        client_sequence_number,
        contents: json!(payload),
    }
}

/// A fresh client id.
pub fn unique_client_id() -> String {
    format!("client-{}", uuid::Uuid::new_v4())
}
