//! # Tandem Protocol — foundation types
//!
//! Wire-level message types and client descriptors for the tandem
//! collaboration service. This crate is the single source of truth for the
//! shapes exchanged with the ordering service and carries no logic beyond
//! serialization and small classification predicates.
//!
//! # Architecture Constraints
//!
//! This crate has zero dependencies on other tandem crates. Pipeline
//! behavior (queues, caching, connection lifecycle) lives in `tandem-delta`;
//! test fixtures live in `tandem-testkit`.

#![forbid(unsafe_code)]

pub mod client;
pub mod messages;

pub use client::{ClientCategory, ClientDescriptor, ReconnectPolicy};
pub use messages::{
    ContentMessage, DocumentMessage, MessageType, NackMessage, SequencedMessage, SignalMessage,
    Trace,
};
