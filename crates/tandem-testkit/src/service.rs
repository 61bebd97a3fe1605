//! Scriptable document service.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::connection::TestConnection;
use tandem_delta::{DeltaConnection, DeltaError, DeltaStorage, DocumentService};
use tandem_protocol::ClientDescriptor;

/// A document service whose stream connections are scripted by the test.
///
/// Each `connect_to_delta_stream` call pops the next scripted outcome and
/// records its arrival instant; an exhausted script yields retryable
/// transport errors, which keeps reconnect loops observable without
/// succeeding.
pub struct TestService {
    storage: Mutex<Result<Arc<dyn DeltaStorage>, DeltaError>>,
    outcomes: Mutex<VecDeque<Result<Arc<TestConnection>, DeltaError>>>,
    attempts: Mutex<Vec<Instant>>,
    storage_resolutions: Mutex<u64>,
}

impl TestService {
    /// A service vending `storage` and an empty connection script.
    pub fn new(storage: Arc<dyn DeltaStorage>) -> Arc<Self> {
        Arc::new(Self {
            storage: Mutex::new(Ok(storage)),
            outcomes: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(Vec::new()),
            storage_resolutions: Mutex::new(0),
        })
    }

    /// A service whose delta storage resolution fails with `err`.
    pub fn with_storage_error(err: DeltaError) -> Arc<Self> {
        Arc::new(Self {
            storage: Mutex::new(Err(err)),
            outcomes: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(Vec::new()),
            storage_resolutions: Mutex::new(0),
        })
    }

    /// Script the next stream connect to succeed with `connection`.
    pub fn queue_connection(&self, connection: Arc<TestConnection>) {
        self.outcomes.lock().push_back(Ok(connection));
    }

    /// Script the next stream connect to fail with `err`.
    pub fn queue_failure(&self, err: DeltaError) {
        self.outcomes.lock().push_back(Err(err));
    }

    /// Instants at which stream connects were attempted (tokio clock).
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    /// How many times delta storage resolution was requested.
    pub fn storage_resolutions(&self) -> u64 {
        *self.storage_resolutions.lock()
    }
}

#[async_trait]
impl DocumentService for TestService {
    async fn connect_to_delta_storage(&self) -> Result<Arc<dyn DeltaStorage>, DeltaError> {
        *self.storage_resolutions.lock() += 1;
        self.storage.lock().clone()
    }

    async fn connect_to_delta_stream(
        &self,
        _client: &ClientDescriptor,
    ) -> Result<Arc<dyn DeltaConnection>, DeltaError> {
        self.attempts.lock().push(Instant::now());
        match self.outcomes.lock().pop_front() {
            Some(Ok(connection)) => {
                let connection: Arc<dyn DeltaConnection> = connection;
                Ok(connection)
            }
            Some(Err(err)) => Err(err),
            None => Err(DeltaError::transport("no scripted connection available")),
        }
    }
}
