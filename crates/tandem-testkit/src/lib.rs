//! # Tandem Testkit
//!
//! In-memory fakes and factories for exercising the delta pipeline without
//! a server: a range-serving op log, a scriptable storage for retry
//! scenarios, an injectable connection, a service that vends both, and a
//! recording handler strategy.
//!
//! # Usage
//!
//! Add to dev-dependencies:
//! ```toml
//! [dev-dependencies]
//! tandem-testkit = { path = "../tandem-testkit" }
//! ```
//!
//! Then build a [`Fixture`], attach the recording handler, connect, and
//! inject traffic through the [`TestConnection`].

#![forbid(unsafe_code)]

pub mod connection;
pub mod factories;
pub mod fixture;
pub mod handler;
pub mod service;
pub mod storage;

pub use connection::TestConnection;
pub use factories::{content, envelope_without_contents, sequenced, sequenced_op, unique_client_id};
pub use fixture::{settle, Fixture};
pub use handler::RecordingHandler;
pub use service::TestService;
pub use storage::{FetchCall, InMemoryStorage, ScriptedStorage};
