//! Injectable delta connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use tandem_delta::{ConnectionDetails, ConnectionEvent, DeltaConnection, DeltaError};
use tandem_protocol::{
    ContentMessage, DocumentMessage, NackMessage, SequencedMessage, SignalMessage,
};

/// A delta connection whose server side is the test: records everything the
/// pipeline submits and lets the test inject any [`ConnectionEvent`].
pub struct TestConnection {
    details: ConnectionDetails,
    events: broadcast::Sender<ConnectionEvent>,
    submitted: Mutex<Vec<DocumentMessage>>,
    submitted_async: Mutex<Vec<DocumentMessage>>,
    signals: Mutex<Vec<Value>>,
    fail_next_submit_async: Mutex<Option<DeltaError>>,
    closed: AtomicBool,
}

impl TestConnection {
    /// A connection with an empty initial backlog.
    pub fn new(client_id: &str) -> Arc<Self> {
        Self::with_details(ConnectionDetails {
            client_id: client_id.to_string(),
            max_message_size: None,
            initial_messages: Vec::new(),
            initial_contents: Vec::new(),
            initial_signals: Vec::new(),
        })
    }

    /// A connection reporting the given details at connect time.
    pub fn with_details(details: ConnectionDetails) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            details,
            events,
            submitted: Mutex::new(Vec::new()),
            submitted_async: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            fail_next_submit_async: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Inject a raw connection event.
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    /// Deliver sequenced messages as live traffic, in the given arrival
    /// order.
    pub fn deliver_ops(&self, ops: Vec<SequencedMessage>) {
        self.emit(ConnectionEvent::Op(ops));
    }

    /// Deliver a split content chunk.
    pub fn deliver_content(&self, content: ContentMessage) {
        self.emit(ConnectionEvent::OpContent(content));
    }

    /// Deliver an out-of-band signal.
    pub fn deliver_signal(&self, signal: SignalMessage) {
        self.emit(ConnectionEvent::Signal(signal));
    }

    /// Repudiate the client's outbound stream.
    pub fn nack(&self, sequence_number: u64) {
        self.emit(ConnectionEvent::Nack(NackMessage {
            sequence_number,
            content: None,
        }));
    }

    /// Drop the connection with a transport reason.
    pub fn drop_connection(&self, reason: &str) {
        self.emit(ConnectionEvent::Disconnect(reason.to_string()));
    }

    /// Report a latency probe answer.
    pub fn pong(&self, latency_ms: u64) {
        self.emit(ConnectionEvent::Pong(latency_ms));
    }

    /// Everything submitted through the fire-and-forget path.
    pub fn submitted(&self) -> Vec<DocumentMessage> {
        self.submitted.lock().clone()
    }

    /// Everything submitted through the acknowledged path.
    pub fn submitted_async(&self) -> Vec<DocumentMessage> {
        self.submitted_async.lock().clone()
    }

    /// Signals submitted by the pipeline.
    pub fn submitted_signals(&self) -> Vec<Value> {
        self.signals.lock().clone()
    }

    /// Make the next `submit_async` call fail with `err`.
    pub fn fail_next_submit_async(&self, err: DeltaError) {
        *self.fail_next_submit_async.lock() = Some(err);
    }

    /// Whether the pipeline has closed this connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeltaConnection for TestConnection {
    fn details(&self) -> ConnectionDetails {
        self.details.clone()
    }

    fn submit(&self, message: DocumentMessage) -> Result<(), DeltaError> {
        if self.is_closed() {
            return Err(DeltaError::transport("connection closed"));
        }
        self.submitted.lock().push(message);
        Ok(())
    }

    async fn submit_async(&self, message: DocumentMessage) -> Result<(), DeltaError> {
        if self.is_closed() {
            return Err(DeltaError::transport("connection closed"));
        }
        if let Some(err) = self.fail_next_submit_async.lock().take() {
            return Err(err);
        }
        self.submitted_async.lock().push(message);
        Ok(())
    }

    fn submit_signal(&self, content: Value) -> Result<(), DeltaError> {
        if self.is_closed() {
            return Err(DeltaError::transport("connection closed"));
        }
        self.signals.lock().push(content);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
