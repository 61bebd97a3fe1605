//! Recording handler strategy.

use async_trait::async_trait;
use parking_lot::Mutex;

use tandem_delta::{DeltaError, DeltaHandler, PrepareContext};
use tandem_protocol::{SequencedMessage, SignalMessage};

/// A handler strategy that records everything delivered to it.
#[derive(Default)]
pub struct RecordingHandler {
    processed: Mutex<Vec<SequencedMessage>>,
    post_processed: Mutex<Vec<u64>>,
    signals: Mutex<Vec<SignalMessage>>,
}

impl RecordingHandler {
    /// A fresh recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages delivered through `process`, in delivery order.
    pub fn processed(&self) -> Vec<SequencedMessage> {
        self.processed.lock().clone()
    }

    /// Sequence numbers delivered through `process`, in delivery order.
    pub fn processed_sequence_numbers(&self) -> Vec<u64> {
        self.processed
            .lock()
            .iter()
            .map(|message| message.sequence_number)
            .collect()
    }

    /// Sequence numbers that completed `post_process`.
    pub fn post_processed(&self) -> Vec<u64> {
        self.post_processed.lock().clone()
    }

    /// Signals delivered through `process_signal`.
    pub fn signals(&self) -> Vec<SignalMessage> {
        self.signals.lock().clone()
    }
}

#[async_trait]
impl DeltaHandler for RecordingHandler {
    async fn prepare(&self, _message: &SequencedMessage) -> Result<PrepareContext, DeltaError> {
        Ok(Box::new(()))
    }

    fn process(
        &self,
        message: &SequencedMessage,
        _context: &PrepareContext,
    ) -> Result<(), DeltaError> {
        self.processed.lock().push(message.clone());
        Ok(())
    }

    async fn post_process(
        &self,
        message: &SequencedMessage,
        _context: PrepareContext,
    ) -> Result<(), DeltaError> {
        self.post_processed.lock().push(message.sequence_number);
        Ok(())
    }

    fn process_signal(&self, signal: &SignalMessage) {
        self.signals.lock().push(signal.clone());
    }
}
