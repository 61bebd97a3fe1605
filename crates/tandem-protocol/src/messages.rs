//! Wire message types exchanged with the ordering service.
//!
//! The ordering service speaks JSON with camelCase field names; every struct
//! here carries `#[serde(rename_all = "camelCase")]` so it encodes
//! wire-compatible output directly. Operation payloads are opaque to this
//! layer and ride as `serde_json::Value`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type taxonomy for document messages.
///
/// Wire values are the short lowercase tags assigned by the ordering
/// service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Document operation carrying an opaque payload.
    #[serde(rename = "op")]
    Operation,
    /// Consensus proposal.
    #[serde(rename = "propose")]
    Propose,
    /// Rejection of a pending proposal.
    #[serde(rename = "reject")]
    Reject,
    /// Empty message submitted only to advance the sender's published
    /// reference sequence number.
    #[serde(rename = "noop")]
    NoOp,
    /// Server notice that a client joined the session.
    #[serde(rename = "join")]
    ClientJoin,
    /// Server notice that a client left the session.
    #[serde(rename = "leave")]
    ClientLeave,
    /// Document fork point.
    #[serde(rename = "fork")]
    Fork,
    /// Integration of a forked branch back into the parent document.
    #[serde(rename = "integrate")]
    Integrate,
}

impl MessageType {
    /// System types are minted by the service itself. Their payload rides in
    /// the top-level `data` field of the envelope instead of `contents`.
    pub fn is_system_type(&self) -> bool {
        matches!(
            self,
            Self::ClientJoin | Self::ClientLeave | Self::Fork | Self::Integrate
        )
    }
}

/// Timing breadcrumb appended to a message as it moves through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    /// Pipeline step, e.g. `"start"` or `"end"`.
    pub action: String,
    /// The service that stamped the trace.
    pub service: String,
    /// Epoch milliseconds at stamping time.
    pub timestamp: u64,
}

/// A message stamped with its global order by the ordering service.
///
/// `sequence_number` is globally monotone per document; clients rely on it
/// being gapless once the inbound pipeline has done its work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedMessage {
    /// Server-assigned position in the document's total order.
    pub sequence_number: u64,
    /// The server's running minimum of all clients' reference sequence
    /// numbers at the time this message was sequenced.
    pub minimum_sequence_number: u64,
    /// The submitting client.
    pub client_id: String,
    /// The submitting client's own counter for this message.
    pub client_sequence_number: u64,
    /// The sequence number the submitting client had observed when it
    /// submitted.
    pub reference_sequence_number: u64,
    /// Message type tag.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Opaque payload. Absent when the service split the contents onto the
    /// content channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<Value>,
    /// Timing breadcrumbs accumulated so far.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traces: Vec<Trace>,
}

/// A client-built envelope awaiting sequencing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMessage {
    /// Client-local counter, reset on every new connection.
    pub client_sequence_number: u64,
    /// The last sequence number the client had processed at submit time.
    pub reference_sequence_number: u64,
    /// Message type tag.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Opaque payload; `None` for system-shaped or split messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<Value>,
    /// System-type payload slot. Populated instead of `contents` for system
    /// message types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Timing breadcrumbs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traces: Vec<Trace>,
}

/// The payload half of a split operation, matched to its envelope by
/// `(client_id, client_sequence_number)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentMessage {
    /// The submitting client.
    pub client_id: String,
    /// The envelope's client sequence number.
    pub client_sequence_number: u64,
    /// The split-off payload.
    pub contents: Value,
}

/// An out-of-band signal, not part of the document's sequenced history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    /// Serialized signal payload; parsed once before handler delivery.
    pub content: Value,
}

/// Server repudiation of a client's in-flight outbound stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NackMessage {
    /// The sequence number the document had reached when the nack was
    /// issued.
    pub sequence_number: u64,
    /// Optional server-provided detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}
