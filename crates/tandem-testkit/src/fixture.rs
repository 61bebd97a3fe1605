//! Assembled pipeline fixture.

use std::sync::Arc;

use crate::connection::TestConnection;
use crate::handler::RecordingHandler;
use crate::service::TestService;
use crate::storage::InMemoryStorage;
use tandem_delta::{DeltaManager, DeltaManagerConfig};
use tandem_protocol::ClientDescriptor;

/// A manager wired to in-memory collaborators, with the first connection
/// already scripted.
pub struct Fixture {
    /// The manager under test.
    pub manager: DeltaManager,
    /// The scripted document service.
    pub service: Arc<TestService>,
    /// The first scripted connection.
    pub connection: Arc<TestConnection>,
    /// The recording handler (attach it via the manager when the test is
    /// ready).
    pub handler: Arc<RecordingHandler>,
    /// The backing op log.
    pub storage: Arc<InMemoryStorage>,
}

impl Fixture {
    /// A browser-client fixture with default configuration.
    pub fn new() -> Self {
        Self::with(ClientDescriptor::browser(), DeltaManagerConfig::default())
    }

    /// A fixture with explicit client descriptor and configuration.
    pub fn with(client: ClientDescriptor, config: DeltaManagerConfig) -> Self {
        let storage = InMemoryStorage::new();
        let service = TestService::new(storage.clone());
        let connection = TestConnection::new("local-client");
        service.queue_connection(connection.clone());
        let manager = DeltaManager::new(service.clone(), client, config);
        Self {
            manager,
            service,
            connection,
            handler: Arc::new(RecordingHandler::new()),
            storage,
        }
    }

    /// Attach the recording handler at `anchor` without triggering the
    /// document-open backfill, then release both inbound queues.
    pub fn arm_at(&self, anchor: u64) {
        self.manager
            .attach_op_handler(anchor, self.handler.clone(), false);
        self.manager.inbound().system_resume();
        self.manager.inbound_signal().system_resume();
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Let spawned pipeline tasks run to quiescence without advancing the
/// clock. Enough rounds for any admission → fetch → catch-up → process
/// chain the fixtures produce.
pub async fn settle() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}
