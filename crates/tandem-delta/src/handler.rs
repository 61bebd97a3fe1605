//! Application-level handler strategy.

use std::any::Any;

use async_trait::async_trait;

use crate::errors::DeltaError;
use tandem_protocol::{SequencedMessage, SignalMessage};

/// Opaque per-message context threaded from [`DeltaHandler::prepare`]
/// through [`DeltaHandler::process`] to [`DeltaHandler::post_process`].
pub type PrepareContext = Box<dyn Any + Send>;

/// Interprets inbound messages on behalf of the embedding document.
///
/// The manager invokes these callbacks strictly one message at a time, in
/// gapless sequence-number order. `prepare` and `post_process` may suspend;
/// `process` runs synchronously between the manager's bookkeeping steps.
#[async_trait]
pub trait DeltaHandler: Send + Sync {
    /// Derive whatever context `process` will need for this message.
    async fn prepare(&self, message: &SequencedMessage) -> Result<PrepareContext, DeltaError>;

    /// Apply the message to application state.
    fn process(&self, message: &SequencedMessage, context: &PrepareContext)
        -> Result<(), DeltaError>;

    /// Asynchronous follow-up work after the message has been applied.
    async fn post_process(
        &self,
        message: &SequencedMessage,
        context: PrepareContext,
    ) -> Result<(), DeltaError>;

    /// Deliver an out-of-band signal. Signals carry no ordering guarantees
    /// relative to sequenced messages.
    fn process_signal(&self, signal: &SignalMessage);
}
