//! Delta storage fakes.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use tandem_delta::{DeltaError, DeltaStorage};
use tandem_protocol::SequencedMessage;

/// One recorded storage request.
#[derive(Debug, Clone)]
pub struct FetchCall {
    /// Exclusive lower bound requested.
    pub from: u64,
    /// Exclusive upper bound requested.
    pub to: Option<u64>,
    /// When the request arrived (tokio clock, so virtual time under paused
    /// tests).
    pub at: Instant,
}

/// Range-serving op log. Serves `from < seq < to` from whatever has been
/// pushed, like a storage service whose write path is the test itself.
pub struct InMemoryStorage {
    ops: Mutex<Vec<SequencedMessage>>,
    calls: Mutex<Vec<FetchCall>>,
}

impl InMemoryStorage {
    /// An empty log.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// A log preloaded with `ops`.
    pub fn with_ops(ops: Vec<SequencedMessage>) -> Arc<Self> {
        let storage = Self::new();
        storage.push_ops(ops);
        storage
    }

    /// Append ops to the log.
    pub fn push_ops(&self, ops: Vec<SequencedMessage>) {
        self.ops.lock().extend(ops);
    }

    /// All requests this storage has served.
    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl DeltaStorage for InMemoryStorage {
    async fn get(&self, from: u64, to: Option<u64>) -> Result<Vec<SequencedMessage>, DeltaError> {
        self.calls.lock().push(FetchCall {
            from,
            to,
            at: Instant::now(),
        });
        let mut matched: Vec<SequencedMessage> = self
            .ops
            .lock()
            .iter()
            .filter(|op| {
                op.sequence_number > from && to.map_or(true, |to| op.sequence_number < to)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|op| op.sequence_number);
        Ok(matched)
    }
}

/// Storage that replays a scripted sequence of responses, then keeps
/// returning empty. Useful for retry and backoff scenarios.
pub struct ScriptedStorage {
    responses: Mutex<VecDeque<Result<Vec<SequencedMessage>, DeltaError>>>,
    calls: Mutex<Vec<FetchCall>>,
}

impl ScriptedStorage {
    /// A storage with no scripted responses yet.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Queue a successful response.
    pub fn push_response(&self, ops: Vec<SequencedMessage>) {
        self.responses.lock().push_back(Ok(ops));
    }

    /// Queue a failure.
    pub fn push_error(&self, err: DeltaError) {
        self.responses.lock().push_back(Err(err));
    }

    /// All requests this storage has served.
    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl DeltaStorage for ScriptedStorage {
    async fn get(&self, from: u64, to: Option<u64>) -> Result<Vec<SequencedMessage>, DeltaError> {
        self.calls.lock().push(FetchCall {
            from,
            to,
            at: Instant::now(),
        });
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}
