//! Typed events and the broadcast hub that carries them.
//!
//! Every event surface in the pipeline is a plain enum over a
//! `tokio::sync::broadcast` channel: the manager's public events, the
//! events a live connection feeds the manager, and the per-queue lifecycle
//! events. Subscribers that fall behind lose the oldest events, which is
//! acceptable for all three surfaces: none of them carries state that
//! cannot be re-derived from the manager itself.

use tokio::sync::broadcast;

use crate::connection::ConnectionDetails;
use crate::errors::DeltaError;
use tandem_protocol::{ContentMessage, NackMessage, SequencedMessage, SignalMessage};

pub(crate) const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Events published by the delta manager.
#[derive(Debug, Clone)]
pub enum DeltaManagerEvent {
    /// A connection to the ordering service is live.
    Connect(ConnectionDetails),
    /// The active connection was lost. `was_nack` is true when the server
    /// repudiated the outbound stream rather than the link dropping.
    Disconnect {
        /// Server-initiated repudiation vs. plain connection loss.
        was_nack: bool,
    },
    /// A queue worker or collaborator failed.
    Error(DeltaError),
    /// Round-trip latency report, in milliseconds.
    Pong(u64),
    /// Inbound processing time for one message, in milliseconds.
    ProcessTime(u64),
}

/// Events a live delta connection feeds into the manager.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Sequenced messages, in arrival order (not necessarily sequence
    /// order).
    Op(Vec<SequencedMessage>),
    /// A split-off content chunk.
    OpContent(ContentMessage),
    /// An out-of-band signal.
    Signal(SignalMessage),
    /// The server repudiated the outbound stream.
    Nack(NackMessage),
    /// The connection dropped, with the transport's reason.
    Disconnect(String),
    /// Latency probe answer, in milliseconds.
    Pong(u64),
    /// Transport-level error report.
    Error(String),
}

/// Lifecycle events observable on a delta queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// The queue left the fully-paused state; emitted before the next item
    /// is processed.
    Resume,
    /// The worker failed; the queue has stopped draining.
    Error(DeltaError),
}

/// Minimal publish/subscribe primitive over a broadcast channel.
///
/// Emitting with no live subscribers is a no-op, not an error.
#[derive(Debug)]
pub struct EventHub<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventHub<E> {
    /// Create a hub retaining up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }
}

impl<E: Clone> Default for EventHub<E> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_delivers_to_all_subscribers() {
        let hub: EventHub<u64> = EventHub::default();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        hub.emit(7);
        assert_eq!(first.recv().await.unwrap(), 7);
        assert_eq!(second.recv().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_noop() {
        let hub: EventHub<u64> = EventHub::default();
        hub.emit(1);

        // only events emitted after subscription are observed
        let mut rx = hub.subscribe();
        hub.emit(2);
        assert_eq!(rx.recv().await.unwrap(), 2);
    }
}
