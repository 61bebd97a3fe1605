//! The delta manager: ordered inbound delivery, reliable outbound
//! submission, and connection lifecycle for one document session.
//!
//! # Architecture
//!
//! The manager owns three [`DeltaQueue`]s (inbound ops, inbound signals,
//! outbound ops), a [`ContentCache`], and the active [`DeltaConnection`].
//! Inbound admission enforces the gap-free invariant: a message is queued
//! only when it directly extends the last queued sequence number;
//! out-of-window arrivals are buffered and trigger a bounded backfill fetch
//! from delta storage. The inbound worker reassembles split contents,
//! drives the handler strategy, and debounces reference-sequence-number
//! acknowledgements. Connections are replaced, never shared, across
//! reconnects; every replacement bumps a generation counter that stale
//! event pumps and deferred work check before touching the pipeline.
//!
//! All state transitions happen under one mutex held only across
//! synchronous sections; suspension points (handler callbacks, storage
//! fetches, backoff sleeps) never hold it.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch, OnceCell};
use tokio::task::JoinHandle;

use crate::cache::ContentCache;
use crate::config::DeltaManagerConfig;
use crate::connection::{ConnectionDetails, DeltaConnection, DeltaStorage, DocumentService};
use crate::errors::DeltaError;
use crate::events::{ConnectionEvent, DeltaManagerEvent, EventHub, QueueEvent};
use crate::handler::DeltaHandler;
use crate::queue::DeltaQueue;
use tandem_protocol::{
    ClientDescriptor, ContentMessage, DocumentMessage, MessageType, SequencedMessage,
    SignalMessage, Trace,
};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters maintained by the delta pipeline. Pure observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeltaStats {
    /// Messages delivered through the handler strategy.
    pub ops_processed: u64,
    /// Arrivals at or below the last queued sequence number, dropped.
    pub duplicates_dropped: u64,
    /// Arrivals beyond the next expected sequence number, buffered.
    pub out_of_window: u64,
    /// Backfill fetches started.
    pub storage_fetches: u64,
    /// Fetch attempts that backed off (error or empty response).
    pub fetch_retries: u64,
    /// Backfill requests skipped because one was already in flight.
    pub fetches_ignored: u64,
    /// Connections successfully established.
    pub connections_established: u64,
    /// Automatic reconnect rounds started.
    pub reconnects: u64,
    /// Nacks received.
    pub nacks: u64,
    /// Reference-sequence-number acks submitted.
    pub acks_submitted: u64,
}

// =============================================================================
// Manager state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

struct ManagerState {
    phase: ConnectionPhase,
    /// Sequence number of the last message handed to the handler.
    base_sequence_number: u64,
    /// Server-reported minimum sequence number of the last processed
    /// message.
    min_sequence_number: u64,
    /// Sequence number of the last message admitted to the inbound queue.
    last_queued_sequence_number: u64,
    /// Largest sequence number ever observed, admitted or not.
    largest_sequence_number: u64,
    /// Outbound counter, reset to 0 on every new connection.
    client_sequence_number: u64,
    readonly: bool,
    closed: bool,
    handler: Option<Arc<dyn DeltaHandler>>,
    connection: Option<Arc<dyn DeltaConnection>>,
    connection_details: Option<ConnectionDetails>,
    generation: u64,
    /// Out-of-window arrivals awaiting backfill.
    pending: Vec<SequencedMessage>,
    fetching: bool,
    ack_timer: Option<JoinHandle<()>>,
    ack_requested: bool,
    stats: DeltaStats,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            base_sequence_number: 0,
            min_sequence_number: 0,
            last_queued_sequence_number: 0,
            largest_sequence_number: 0,
            client_sequence_number: 0,
            readonly: true,
            closed: false,
            handler: None,
            connection: None,
            connection_details: None,
            generation: 0,
            pending: Vec::new(),
            fetching: false,
            ack_timer: None,
            ack_requested: false,
            stats: DeltaStats::default(),
        }
    }
}

type ConnectResult = Option<Result<ConnectionDetails, DeltaError>>;

struct ManagerInner {
    service: Arc<dyn DocumentService>,
    client: ClientDescriptor,
    config: DeltaManagerConfig,
    events: EventHub<DeltaManagerEvent>,
    inbound: DeltaQueue<SequencedMessage>,
    inbound_signal: DeltaQueue<SignalMessage>,
    outbound: DeltaQueue<DocumentMessage>,
    cache: ContentCache,
    storage: OnceCell<Result<Arc<dyn DeltaStorage>, DeltaError>>,
    connect_tx: watch::Sender<ConnectResult>,
    connect_rx: watch::Receiver<ConnectResult>,
    state: Mutex<ManagerState>,
}

// =============================================================================
// Public surface
// =============================================================================

/// Orchestrates one client's participation in a document session.
///
/// Must be created inside a tokio runtime; queue draining, backfill, and
/// reconnect all run on spawned tasks. Cheap to clone; all clones share the
/// same pipeline.
#[derive(Clone)]
pub struct DeltaManager {
    inner: Arc<ManagerInner>,
}

impl DeltaManager {
    /// Construct a manager for `client` against `service`. All queues start
    /// paused; call [`DeltaManager::attach_op_handler`] to arm processing
    /// and [`DeltaManager::connect`] to go live.
    pub fn new(
        service: Arc<dyn DocumentService>,
        client: ClientDescriptor,
        config: DeltaManagerConfig,
    ) -> Self {
        let (connect_tx, connect_rx) = watch::channel(None);

        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let inbound = {
                let weak = weak.clone();
                DeltaQueue::new(
                    "inbound",
                    Arc::new(move |message: SequencedMessage| {
                        let weak = weak.clone();
                        async move {
                            match weak.upgrade() {
                                Some(inner) => inner.process_inbound(message).await,
                                None => Ok(()),
                            }
                        }
                        .boxed()
                    }),
                )
            };
            let inbound_signal = {
                let weak = weak.clone();
                DeltaQueue::new(
                    "inbound-signal",
                    Arc::new(move |signal: SignalMessage| {
                        let weak = weak.clone();
                        async move {
                            match weak.upgrade() {
                                Some(inner) => inner.process_inbound_signal(signal).await,
                                None => Ok(()),
                            }
                        }
                        .boxed()
                    }),
                )
            };
            let outbound = {
                let weak = weak.clone();
                DeltaQueue::new(
                    "outbound",
                    Arc::new(move |message: DocumentMessage| {
                        let weak = weak.clone();
                        async move {
                            match weak.upgrade() {
                                Some(inner) => inner.process_outbound(message).await,
                                None => Ok(()),
                            }
                        }
                        .boxed()
                    }),
                )
            };

            let cache = ContentCache::new(config.content.buffer_size);

            ManagerInner {
                service,
                client,
                config,
                events: EventHub::default(),
                inbound,
                inbound_signal,
                outbound,
                cache,
                storage: OnceCell::new(),
                connect_tx,
                connect_rx,
                state: Mutex::new(ManagerState::new()),
            }
        });

        // queue failures surface as manager errors
        inner.forward_queue_errors(inner.inbound.subscribe());
        inner.forward_queue_errors(inner.inbound_signal.subscribe());
        inner.forward_queue_errors(inner.outbound.subscribe());

        Self { inner }
    }

    /// Anchor the pipeline at `sequence_number` and install the handler
    /// strategy. With `resume`, both inbound queues are released and a
    /// backfill is started to pull anything sequenced past the anchor.
    pub fn attach_op_handler(
        &self,
        sequence_number: u64,
        handler: Arc<dyn DeltaHandler>,
        resume: bool,
    ) {
        self.inner
            .attach_op_handler(sequence_number, handler, resume);
    }

    /// Connect to the delta stream. Idempotent: overlapping calls share one
    /// underlying attempt and resolve with the same details.
    pub async fn connect(&self, reason: &str) -> Result<ConnectionDetails, DeltaError> {
        self.inner.connect(reason).await
    }

    /// Build and enqueue a local operation. Returns the client sequence
    /// number assigned to the envelope.
    pub fn submit(
        &self,
        message_type: MessageType,
        contents: Option<Value>,
    ) -> Result<u64, DeltaError> {
        self.inner.submit_message(message_type, contents)
    }

    /// Send an out-of-band signal over the active connection.
    pub fn submit_signal(&self, content: Value) -> Result<(), DeltaError> {
        let connection = {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(DeltaError::Closed);
            }
            state
                .connection
                .clone()
                .ok_or_else(|| DeltaError::transport("no active connection for signal"))?
        };
        connection.submit_signal(content)
    }

    /// Fetch sequenced messages with `from < seq < to` from delta storage,
    /// retrying with exponential backoff until the range is satisfied or
    /// the manager closes. Returns an empty vec once closed.
    pub async fn get_deltas(
        &self,
        reason: &str,
        from: u64,
        to: Option<u64>,
    ) -> Vec<SequencedMessage> {
        self.inner.get_deltas(reason, from, to).await
    }

    /// Stop acknowledging processed sequence numbers. Readonly clients
    /// never submit acks.
    pub fn enable_readonly_mode(&self) {
        self.inner.state.lock().readonly = true;
        self.inner.stop_sequence_number_update();
    }

    /// Resume acknowledging processed sequence numbers.
    pub fn disable_readonly_mode(&self) {
        self.inner.state.lock().readonly = false;
    }

    /// Terminal shutdown: queues cleared and paused, the connection closed,
    /// timers cancelled. Safe to call more than once.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Subscribe to manager events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeltaManagerEvent> {
        self.inner.events.subscribe()
    }

    /// The inbound op queue handle.
    pub fn inbound(&self) -> &DeltaQueue<SequencedMessage> {
        &self.inner.inbound
    }

    /// The outbound op queue handle.
    pub fn outbound(&self) -> &DeltaQueue<DocumentMessage> {
        &self.inner.outbound
    }

    /// The inbound signal queue handle.
    pub fn inbound_signal(&self) -> &DeltaQueue<SignalMessage> {
        &self.inner.inbound_signal
    }

    /// Sequence number of the last message processed by the handler.
    pub fn reference_sequence_number(&self) -> u64 {
        self.inner.state.lock().base_sequence_number
    }

    /// Server-reported minimum sequence number of the last processed
    /// message.
    pub fn minimum_sequence_number(&self) -> u64 {
        self.inner.state.lock().min_sequence_number
    }

    /// Sequence number of the last message admitted to the inbound queue.
    pub fn last_queued_sequence_number(&self) -> u64 {
        self.inner.state.lock().last_queued_sequence_number
    }

    /// Largest message the current connection accepts, or the configured
    /// default when disconnected or unreported.
    pub fn max_message_size(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .connection_details
            .as_ref()
            .and_then(|details| details.max_message_size)
            .unwrap_or(self.inner.config.content.chunk_size)
    }

    /// Threshold above which string payloads are split onto the content
    /// channel.
    pub fn max_content_size(&self) -> usize {
        self.inner.config.content.max_content_size
    }

    /// The wire type tag of this client.
    pub fn client_type(&self) -> &str {
        self.inner.client.type_name()
    }

    /// Snapshot of the pipeline counters.
    pub fn statistics(&self) -> DeltaStats {
        self.inner.state.lock().stats.clone()
    }

    /// Whether [`DeltaManager::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

// =============================================================================
// Pipeline internals
// =============================================================================

impl ManagerInner {
    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn emit(&self, event: DeltaManagerEvent) {
        if self.is_closed() {
            return;
        }
        self.events.emit(event);
    }

    fn forward_queue_errors(self: &Arc<Self>, mut events: broadcast::Receiver<QueueEvent>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(QueueEvent::Error(err)) => match weak.upgrade() {
                        Some(inner) => inner.emit(DeltaManagerEvent::Error(err)),
                        None => return,
                    },
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    async fn delta_storage(&self) -> Result<Arc<dyn DeltaStorage>, DeltaError> {
        self.storage
            .get_or_init(|| async { self.service.connect_to_delta_storage().await })
            .await
            .clone()
    }

    // -------------------------------------------------------------------------
    // Inbound admission
    // -------------------------------------------------------------------------

    fn enqueue_messages(self: &Arc<Self>, messages: Vec<SequencedMessage>) {
        for message in messages {
            self.enqueue_message(message);
        }
    }

    fn enqueue_message(self: &Arc<Self>, message: SequencedMessage) {
        let sequence_number = message.sequence_number;
        let mut deliver = None;
        let mut fetch = None;
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.largest_sequence_number = state.largest_sequence_number.max(sequence_number);
            if sequence_number == state.last_queued_sequence_number + 1 {
                state.last_queued_sequence_number = sequence_number;
                deliver = Some(message);
            } else if sequence_number <= state.last_queued_sequence_number {
                state.stats.duplicates_dropped += 1;
                tracing::debug!(
                    sequence_number,
                    last_queued = state.last_queued_sequence_number,
                    "dropping duplicate sequenced message"
                );
            } else {
                state.stats.out_of_window += 1;
                fetch = Some((state.last_queued_sequence_number, sequence_number));
                state.pending.push(message);
            }
        }
        if let Some(message) = deliver {
            self.inbound.push(message);
        }
        if let Some((from, to)) = fetch {
            self.fetch_missing_deltas("gap", from, Some(to));
        }
    }

    /// Start a single-flight backfill covering `(from, to)`.
    fn fetch_missing_deltas(self: &Arc<Self>, reason: &'static str, from: u64, to: Option<u64>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if state.fetching {
                state.stats.fetches_ignored += 1;
                tracing::debug!(reason, from, "backfill already in flight");
                return;
            }
            state.fetching = true;
            state.stats.storage_fetches += 1;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            let messages = inner.get_deltas(reason, from, to).await;
            inner.state.lock().fetching = false;
            inner.catch_up(reason, messages);
        });
    }

    async fn get_deltas(&self, reason: &str, from: u64, to: Option<u64>) -> Vec<SequencedMessage> {
        // a closed manager does no work, not even storage resolution
        if self.is_closed() {
            tracing::debug!(reason, from, "closed, skipping delta fetch");
            return Vec::new();
        }

        let storage = match self.delta_storage().await {
            Ok(storage) => storage,
            Err(err) => {
                tracing::error!(reason, error = %err, "delta storage unavailable");
                self.emit(DeltaManagerEvent::Error(err));
                return Vec::new();
            }
        };

        let max_batch = self.config.fetch.max_batch_deltas;
        let mut result: Vec<SequencedMessage> = Vec::new();
        let mut from = from;
        let mut retry: u32 = 0;
        loop {
            if self.is_closed() {
                tracing::debug!(reason, from, "closed mid-fetch, abandoning");
                return Vec::new();
            }

            let window_to = match to {
                Some(to) => to.min(from + max_batch),
                None => from + max_batch,
            };
            // exclusive on both ends
            let requested = window_to.saturating_sub(from).saturating_sub(1);

            let fetched = match storage.get(from, Some(window_to)).await {
                Ok(messages) if !messages.is_empty() => Some(messages),
                Ok(_) => None,
                Err(err) => {
                    tracing::warn!(reason, from, retry, error = %err, "delta fetch failed");
                    None
                }
            };

            match fetched {
                Some(messages) => {
                    retry = 0;
                    let count = messages.len() as u64;
                    let last_fetched = messages
                        .last()
                        .map(|message| message.sequence_number)
                        .unwrap_or(from);
                    result.extend(messages);
                    let done = match to {
                        Some(to) => last_fetched + 1 >= to,
                        None => count < requested,
                    };
                    if done {
                        return result;
                    }
                    from = last_fetched;
                }
                None => {
                    let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
                    let delay = self
                        .config
                        .fetch
                        .missing_fetch_delay
                        .saturating_mul(factor)
                        .min(self.config.fetch.max_fetch_delay);
                    retry += 1;
                    self.state.lock().stats.fetch_retries += 1;
                    tracing::debug!(reason, from, retry, delay_ms = delay.as_millis() as u64, "delta fetch backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Feed backfilled messages through admission, then flush the pending
    /// buffer in sequence order. Any gap that survives re-triggers a fetch.
    fn catch_up(self: &Arc<Self>, reason: &str, messages: Vec<SequencedMessage>) {
        tracing::debug!(reason, count = messages.len(), "catching up");
        self.enqueue_messages(messages);

        let mut pending = std::mem::take(&mut self.state.lock().pending);
        pending.sort_by_key(|message| message.sequence_number);
        self.enqueue_messages(pending);
    }

    // -------------------------------------------------------------------------
    // Inbound processing
    // -------------------------------------------------------------------------

    async fn process_inbound(
        self: Arc<Self>,
        mut message: SequencedMessage,
    ) -> Result<(), DeltaError> {
        let started = Instant::now();

        if message.contents.is_none() {
            self.reassemble_content(&mut message).await?;
        }

        let handler = {
            let state = self.state.lock();
            assert_eq!(
                message.sequence_number,
                state.base_sequence_number + 1,
                "non-contiguous sequence number reached the inbound worker"
            );
            state
                .handler
                .clone()
                .ok_or_else(|| DeltaError::internal("inbound message with no handler attached"))?
        };

        // legacy servers deliver contents as a serialized string; leave
        // messages carry a bare client id, everything else is JSON
        if let Some(Value::String(raw)) = &message.contents {
            if message.message_type != MessageType::ClientLeave {
                message.contents = Some(serde_json::from_str(raw)?);
            }
        }

        let context = handler.prepare(&message).await?;

        if !message.traces.is_empty() {
            message.traces.push(Trace {
                action: "end".to_string(),
                service: self.client.type_name().to_string(),
                timestamp: now_ms(),
            });
        }

        {
            let mut state = self.state.lock();
            state.min_sequence_number = message.minimum_sequence_number;
            state.base_sequence_number = message.sequence_number;
            state.stats.ops_processed += 1;
        }

        handler.process(&message, &context)?;

        if matches!(
            message.message_type,
            MessageType::Operation | MessageType::Propose
        ) {
            self.schedule_sequence_number_update(message.message_type);
        }

        self.emit(DeltaManagerEvent::ProcessTime(
            started.elapsed().as_millis() as u64,
        ));

        handler.post_process(&message, context).await
    }

    async fn process_inbound_signal(
        self: Arc<Self>,
        mut signal: SignalMessage,
    ) -> Result<(), DeltaError> {
        let handler = self
            .state
            .lock()
            .handler
            .clone()
            .ok_or_else(|| DeltaError::internal("signal with no handler attached"))?;

        // signal content arrives serialized; parse once before delivery
        if let Value::String(raw) = &signal.content {
            signal.content = serde_json::from_str(raw)?;
        }
        handler.process_signal(&signal);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Content reassembly
    // -------------------------------------------------------------------------

    async fn reassemble_content(
        &self,
        message: &mut SequencedMessage,
    ) -> Result<(), DeltaError> {
        let client_id = message.client_id.clone();
        let content = match self.cache.peek(&client_id) {
            None => {
                self.wait_for_content(
                    &client_id,
                    message.client_sequence_number,
                    message.sequence_number,
                )
                .await?
            }
            Some(cached) if cached.client_sequence_number > message.client_sequence_number => {
                // the cache has overshot this envelope: its chunk never made
                // it in (evicted or lost), so fetch the full op instead
                self.fetch_content(
                    &client_id,
                    message.client_sequence_number,
                    message.sequence_number,
                )
                .await?
            }
            Some(cached) if cached.client_sequence_number < message.client_sequence_number => {
                loop {
                    let Some(candidate) = self.cache.get(&client_id) else {
                        panic!("content cache drained without a chunk for client {client_id}");
                    };
                    if candidate.client_sequence_number == message.client_sequence_number {
                        break candidate;
                    }
                    tracing::debug!(
                        client_id = %client_id,
                        client_sequence_number = candidate.client_sequence_number,
                        "discarding stale cached content"
                    );
                }
            }
            Some(_) => self
                .cache
                .get(&client_id)
                .ok_or_else(|| DeltaError::internal("cached content vanished between peek and get"))?,
        };

        message.contents = Some(content.contents);
        Ok(())
    }

    /// Race the cache's arrival announcements against a targeted storage
    /// fetch; whichever produces the chunk first wins.
    async fn wait_for_content(
        &self,
        client_id: &str,
        client_sequence_number: u64,
        sequence_number: u64,
    ) -> Result<ContentMessage, DeltaError> {
        let mut arrivals = self.cache.subscribe();

        // the chunk may have landed between the cache miss and subscribing
        if let Some(cached) = self.cache.peek(client_id) {
            if cached.client_sequence_number == client_sequence_number {
                if let Some(content) = self.cache.get(client_id) {
                    return Ok(content);
                }
            }
        }

        let from_cache = async {
            loop {
                match arrivals.recv().await {
                    Ok(id) if id == client_id => {
                        if let Some(cached) = self.cache.peek(client_id) {
                            if cached.client_sequence_number == client_sequence_number {
                                if let Some(content) = self.cache.get(client_id) {
                                    return content;
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        futures::future::pending::<()>().await;
                    }
                }
            }
        };

        tokio::select! {
            content = from_cache => Ok(content),
            fetched = self.fetch_content(client_id, client_sequence_number, sequence_number) => fetched,
        }
    }

    /// Fetch the single op at `sequence_number` from storage and lift its
    /// contents. A mismatched identity means server or cache corruption.
    async fn fetch_content(
        &self,
        client_id: &str,
        client_sequence_number: u64,
        sequence_number: u64,
    ) -> Result<ContentMessage, DeltaError> {
        let messages = self
            .get_deltas(
                "content",
                sequence_number.saturating_sub(1),
                Some(sequence_number + 1),
            )
            .await;

        let Some(message) = messages.into_iter().next() else {
            return if self.is_closed() {
                Err(DeltaError::Closed)
            } else {
                Err(DeltaError::storage(format!(
                    "targeted fetch for sequence number {sequence_number} returned nothing"
                )))
            };
        };

        assert_eq!(
            message.client_id, client_id,
            "fetched op belongs to a different client"
        );
        assert_eq!(
            message.client_sequence_number, client_sequence_number,
            "fetched op does not match the envelope's client sequence number"
        );

        let contents = message
            .contents
            .ok_or_else(|| DeltaError::storage("fetched op has no contents"))?;
        Ok(ContentMessage {
            client_id: message.client_id,
            client_sequence_number: message.client_sequence_number,
            contents,
        })
    }

    // -------------------------------------------------------------------------
    // Reference-sequence-number acknowledgements
    // -------------------------------------------------------------------------

    /// Debounced no-op emission keeping the server's minimum-sequence-number
    /// calculation converging without an ack per op. Proposals are
    /// acknowledged immediately so consensus rounds do not stall on the
    /// debounce window.
    fn schedule_sequence_number_update(self: &Arc<Self>, message_type: MessageType) {
        if message_type == MessageType::Propose {
            {
                let state = self.state.lock();
                if state.readonly || state.closed {
                    return;
                }
            }
            if let Err(err) =
                self.submit_message(MessageType::NoOp, Some(Value::String(String::new())))
            {
                tracing::debug!(error = %err, "immediate proposal ack dropped");
            } else {
                self.state.lock().stats.acks_submitted += 1;
            }
            return;
        }

        let mut state = self.state.lock();
        if state.readonly || state.closed {
            return;
        }
        if state.ack_timer.is_some() {
            state.ack_requested = true;
            return;
        }

        let weak = Arc::downgrade(self);
        let interval = self.config.ack_interval;
        state.ack_timer = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let fire = {
                    let mut state = inner.state.lock();
                    if state.ack_requested {
                        // processing continued during the window: hold the
                        // ack for another interval
                        state.ack_requested = false;
                        false
                    } else {
                        state.ack_timer = None;
                        true
                    }
                };
                if fire {
                    if let Err(err) = inner.submit_message(MessageType::NoOp, Some(Value::Null)) {
                        tracing::debug!(error = %err, "reference sequence number ack dropped");
                    } else {
                        inner.state.lock().stats.acks_submitted += 1;
                    }
                    return;
                }
            }
        }));
    }

    fn stop_sequence_number_update(&self) {
        let timer = {
            let mut state = self.state.lock();
            state.ack_requested = false;
            state.ack_timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    fn submit_message(
        self: &Arc<Self>,
        message_type: MessageType,
        contents: Option<Value>,
    ) -> Result<u64, DeltaError> {
        let message = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(DeltaError::Closed);
            }
            state.client_sequence_number += 1;
            let mut message = DocumentMessage {
                client_sequence_number: state.client_sequence_number,
                reference_sequence_number: state.base_sequence_number,
                message_type,
                contents,
                data: None,
                traces: vec![Trace {
                    action: "start".to_string(),
                    service: self.client.type_name().to_string(),
                    timestamp: now_ms(),
                }],
            };
            if message.message_type.is_system_type() {
                message.data = message.contents.take();
            }
            state.readonly = false;
            message
        };

        // a local op supersedes any pending ack
        self.stop_sequence_number_update();

        let client_sequence_number = message.client_sequence_number;
        self.outbound.push(message);
        Ok(client_sequence_number)
    }

    async fn process_outbound(
        self: Arc<Self>,
        mut message: DocumentMessage,
    ) -> Result<(), DeltaError> {
        let (connection, client_id) = {
            let state = self.state.lock();
            let connection = state
                .connection
                .clone()
                .ok_or_else(|| DeltaError::transport("no active connection for outbound op"))?;
            let client_id = state
                .connection_details
                .as_ref()
                .map(|details| details.client_id.clone())
                .unwrap_or_default();
            (connection, client_id)
        };

        let oversize = matches!(
            &message.contents,
            Some(Value::String(text)) if text.len() > self.config.content.max_content_size
        );

        if oversize {
            // reserve the sequence slot first; only then park the payload
            // and send the stripped envelope
            connection.submit_async(message.clone()).await?;
            if let Some(contents) = message.contents.take() {
                self.cache.set(ContentMessage {
                    client_id,
                    client_sequence_number: message.client_sequence_number,
                    contents,
                });
            }
            connection.submit(message)?;
        } else {
            connection.submit(message)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Connection state machine
    // -------------------------------------------------------------------------

    async fn connect(self: &Arc<Self>, reason: &str) -> Result<ConnectionDetails, DeltaError> {
        {
            let mut state = self.state.lock();
            match state.phase {
                ConnectionPhase::Closed => return Err(DeltaError::Closed),
                ConnectionPhase::Connected | ConnectionPhase::Connecting => {}
                ConnectionPhase::Disconnected => {
                    state.phase = ConnectionPhase::Connecting;
                    let _ = self.connect_tx.send(None);
                    let inner = self.clone();
                    let reason = reason.to_string();
                    tokio::spawn(async move {
                        inner.connect_driver(&reason).await;
                    });
                }
            }
        }

        let mut pending = self.connect_rx.clone();
        loop {
            let resolved = pending.borrow_and_update().clone();
            if let Some(result) = resolved {
                return result;
            }
            if pending.changed().await.is_err() {
                return Err(DeltaError::Closed);
            }
        }
    }

    async fn connect_driver(self: Arc<Self>, reason: &str) {
        // resolve storage before dialing; a document without history access
        // cannot catch up, so this failure is surfaced, not retried
        if let Err(err) = self.delta_storage().await {
            tracing::error!(error = %err, "delta storage unavailable, aborting connect");
            self.emit(DeltaManagerEvent::Error(err.clone()));
            {
                let mut state = self.state.lock();
                if state.phase == ConnectionPhase::Connecting {
                    state.phase = ConnectionPhase::Disconnected;
                }
            }
            self.connect_tx.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(Err(err));
                    true
                } else {
                    false
                }
            });
            return;
        }

        self.connect_core(reason, self.config.reconnect.initial_delay)
            .await;
    }

    /// Dial until a connection lands or the manager closes. The first retry
    /// waits `initial_delay`; each subsequent failure doubles the wait up to
    /// the configured ceiling.
    async fn connect_core(self: &Arc<Self>, reason: &str, initial_delay: Duration) {
        let mut delay = initial_delay;
        loop {
            if self.is_closed() {
                return;
            }
            match self.service.connect_to_delta_stream(&self.client).await {
                Ok(connection) => {
                    self.install_connection(connection, reason);
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        reason,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "connect attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.reconnect.max_delay);
                }
            }
        }
    }

    fn install_connection(self: &Arc<Self>, connection: Arc<dyn DeltaConnection>, reason: &str) {
        let details = connection.details();
        let generation = {
            let mut state = self.state.lock();
            if state.closed {
                connection.close();
                return;
            }
            state.generation += 1;
            state.connection = Some(connection.clone());
            state.connection_details = Some(details.clone());
            state.phase = ConnectionPhase::Connected;
            state.client_sequence_number = 0;
            state.stats.connections_established += 1;
            state.generation
        };

        tracing::info!(reason, client_id = %details.client_id, "connected to delta stream");

        // subscribe before announcing the connection so nothing emitted
        // after connect() resolves can be missed
        let events = connection.subscribe();
        self.spawn_event_pump(events, generation);

        self.outbound.system_resume();

        self.connect_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(Ok(details.clone()));
                true
            } else {
                false
            }
        });

        self.process_initial_backlog(details.clone(), generation);
        self.emit(DeltaManagerEvent::Connect(details));
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<ConnectionEvent>,
        generation: u64,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "connection event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.is_closed() || inner.generation() != generation {
                    return;
                }
                match event {
                    ConnectionEvent::Op(messages) => inner.enqueue_messages(messages),
                    ConnectionEvent::OpContent(content) => inner.cache.set(content),
                    ConnectionEvent::Signal(signal) => inner.inbound_signal.push(signal),
                    ConnectionEvent::Nack(nack) => {
                        tracing::warn!(
                            sequence_number = nack.sequence_number,
                            "outbound stream nacked"
                        );
                        inner.state.lock().stats.nacks += 1;
                        inner.handle_disconnect(generation, true, "nack");
                        return;
                    }
                    ConnectionEvent::Disconnect(reason) => {
                        inner.handle_disconnect(generation, false, &reason);
                        return;
                    }
                    ConnectionEvent::Pong(latency) => {
                        inner.emit(DeltaManagerEvent::Pong(latency));
                    }
                    ConnectionEvent::Error(message) => {
                        inner.emit(DeltaManagerEvent::Error(DeltaError::transport(message)));
                    }
                }
            }
        });
    }

    fn handle_disconnect(self: &Arc<Self>, generation: u64, was_nack: bool, reason: &str) {
        let connection = {
            let mut state = self.state.lock();
            if state.closed || state.generation != generation {
                return;
            }
            state.phase = ConnectionPhase::Disconnected;
            state.connection_details = None;
            state.connection.take()
        };

        self.outbound.system_pause();
        self.outbound.clear();

        tracing::info!(reason, was_nack, "disconnected from delta stream");
        self.emit(DeltaManagerEvent::Disconnect { was_nack });

        if let Some(connection) = connection {
            connection.close();
        }

        if self.client.should_reconnect() {
            {
                let mut state = self.state.lock();
                state.phase = ConnectionPhase::Connecting;
                state.stats.reconnects += 1;
            }
            let inner = self.clone();
            let reason = reason.to_string();
            tokio::spawn(async move {
                inner
                    .connect_core(&reason, inner.config.reconnect.initial_delay)
                    .await;
            });
        } else {
            self.inbound.system_pause();
            self.inbound.clear();
            self.inbound_signal.system_pause();
            self.inbound_signal.clear();
        }
    }

    fn process_initial_backlog(self: &Arc<Self>, details: ConnectionDetails, generation: u64) {
        if details.initial_messages.is_empty()
            && details.initial_contents.is_empty()
            && details.initial_signals.is_empty()
        {
            return;
        }

        let mut resumes = self.inbound.subscribe();
        if !self.inbound.is_paused() {
            self.apply_initial_backlog(details);
            return;
        }

        // handler not armed yet: hold the backlog until the inbound queue
        // resumes
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match resumes.recv().await {
                    Ok(QueueEvent::Resume) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // the resume may have been among the skipped events
                        match weak.upgrade() {
                            Some(inner) if !inner.inbound.is_paused() => break,
                            Some(_) => {}
                            None => return,
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.is_closed() || inner.generation() != generation {
                return;
            }
            inner.apply_initial_backlog(details);
        });
    }

    fn apply_initial_backlog(self: &Arc<Self>, details: ConnectionDetails) {
        // contents first, so reassembly finds chunks already parked
        for content in details.initial_contents {
            self.cache.set(content);
        }
        if !details.initial_messages.is_empty() {
            self.catch_up("InitialOps", details.initial_messages);
        }
        for signal in details.initial_signals {
            self.inbound_signal.push(signal);
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    fn attach_op_handler(
        self: &Arc<Self>,
        sequence_number: u64,
        handler: Arc<dyn DeltaHandler>,
        resume: bool,
    ) {
        {
            let mut state = self.state.lock();
            state.base_sequence_number = sequence_number;
            state.min_sequence_number = sequence_number;
            state.last_queued_sequence_number = sequence_number;
            state.largest_sequence_number = sequence_number;
            state.handler = Some(handler);
        }
        tracing::debug!(sequence_number, resume, "op handler attached");

        if resume {
            self.inbound.system_resume();
            self.inbound_signal.system_resume();
            // pull anything sequenced past the anchor
            self.fetch_missing_deltas("DocumentOpen", sequence_number, None);
        }
    }

    fn close(&self) {
        let (connection, timer) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.phase = ConnectionPhase::Closed;
            state.handler = None;
            state.pending.clear();
            state.ack_requested = false;
            (state.connection.take(), state.ack_timer.take())
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(connection) = connection {
            connection.close();
        }

        self.inbound.system_pause();
        self.inbound.clear();
        self.inbound_signal.system_pause();
        self.inbound_signal.clear();
        self.outbound.system_pause();
        self.outbound.clear();

        // release anyone still waiting on connect()
        self.connect_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(Err(DeltaError::Closed));
                true
            } else {
                false
            }
        });

        tracing::info!("delta manager closed");
    }
}
