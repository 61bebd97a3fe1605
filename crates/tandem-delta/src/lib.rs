//! # Tandem Delta — the client-side delta manager
//!
//! A client participates in a document session by exchanging two streams
//! with a central ordering service: an outbound stream of local operations
//! and an inbound stream of server-sequenced operations, content chunks,
//! and signals. This crate guarantees that the application-level handler
//! observes inbound operations in strict, gapless sequence-number order,
//! regardless of network reordering, disconnects, content arriving split
//! from its envelope, or reconnect-driven retransmission.
//!
//! # Architecture
//!
//! - [`queue::DeltaQueue`] — paused-by-default single-consumer work queue;
//!   three instances carry inbound ops, inbound signals, and outbound ops.
//! - [`cache::ContentCache`] — bounded buffer matching split content chunks
//!   to their envelopes.
//! - [`manager::DeltaManager`] — the orchestrator: gap detection and
//!   backfill, content reassembly, the reference-sequence-number ack
//!   throttle, and the connection state machine with exponential backoff.
//! - [`connection`] / [`handler`] — the collaborator seams: the document
//!   service, delta storage, the live delta connection, and the
//!   application handler strategy.
//!
//! The transport itself, payload interpretation, and conflict resolution
//! are all out of scope; payloads are opaque `serde_json::Value`s.

#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod connection;
pub mod errors;
pub mod events;
pub mod handler;
pub mod manager;
pub mod queue;

pub use cache::ContentCache;
pub use config::{ContentConfig, DeltaManagerConfig, FetchConfig, ReconnectConfig};
pub use connection::{ConnectionDetails, DeltaConnection, DeltaStorage, DocumentService};
pub use errors::{DeltaError, DeltaResult};
pub use events::{ConnectionEvent, DeltaManagerEvent, EventHub, QueueEvent};
pub use handler::{DeltaHandler, PrepareContext};
pub use manager::{DeltaManager, DeltaStats};
pub use queue::DeltaQueue;
