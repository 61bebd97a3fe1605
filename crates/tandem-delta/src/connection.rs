//! Collaborator contracts for the ordering service.
//!
//! The delta manager drives three external seams: the document service that
//! hands out the other two, the delta storage that serves historical op
//! ranges, and the live delta connection that carries the op/content/signal
//! streams. Implementations own their transport entirely; the manager only
//! observes the typed events a connection publishes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::errors::DeltaError;
use crate::events::ConnectionEvent;
use tandem_protocol::{
    ClientDescriptor, ContentMessage, DocumentMessage, SequencedMessage, SignalMessage,
};

/// Session facts reported by the ordering service at connect time.
///
/// The initial backlog (`initial_*`) covers everything the server sequenced
/// between the client's anchor and the moment the connection came up; the
/// manager replays it through the regular pipeline before live traffic.
#[derive(Debug, Clone)]
pub struct ConnectionDetails {
    /// Server-assigned identity for this session.
    pub client_id: String,
    /// Largest message the server accepts on this connection, when the
    /// server reports one.
    pub max_message_size: Option<usize>,
    /// Sequenced messages queued for this client at connect time.
    pub initial_messages: Vec<SequencedMessage>,
    /// Split content chunks queued at connect time.
    pub initial_contents: Vec<ContentMessage>,
    /// Signals queued at connect time.
    pub initial_signals: Vec<SignalMessage>,
}

/// A live, ordered session to the delta stream.
#[async_trait]
pub trait DeltaConnection: Send + Sync {
    /// Connection facts captured at connect time.
    fn details(&self) -> ConnectionDetails;

    /// Fire-and-forget submission of an envelope.
    fn submit(&self, message: DocumentMessage) -> Result<(), DeltaError>;

    /// Submission that resolves once the server has accepted the envelope.
    /// Used to reserve a sequence slot before a split payload follows.
    async fn submit_async(&self, message: DocumentMessage) -> Result<(), DeltaError>;

    /// Send an out-of-band signal.
    fn submit_signal(&self, content: Value) -> Result<(), DeltaError>;

    /// Subscribe to the connection's event stream.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Tear the connection down. Idempotent.
    fn close(&self);
}

/// Read access to the document's sequenced-op history.
#[async_trait]
pub trait DeltaStorage: Send + Sync {
    /// Fetch messages with `from < seq < to`, ascending. `to = None` reads
    /// toward the current tail of the document.
    async fn get(&self, from: u64, to: Option<u64>) -> Result<Vec<SequencedMessage>, DeltaError>;
}

/// Entry point to a document's delta services.
#[async_trait]
pub trait DocumentService: Send + Sync {
    /// Resolve the delta storage endpoint for this document.
    async fn connect_to_delta_storage(&self) -> Result<Arc<dyn DeltaStorage>, DeltaError>;

    /// Dial a live delta stream connection for `client`.
    async fn connect_to_delta_stream(
        &self,
        client: &ClientDescriptor,
    ) -> Result<Arc<dyn DeltaConnection>, DeltaError>;
}
