//! PostgreSQL wire protocol engine.
//!
//! Drives one logical connection over any `AsyncRead + AsyncWrite` stream:
//! frontend message encoding, backend message decoding, an explicit
//! connection state machine, and the logical replication sub-protocol.
//!
//! - [`Connection`] runs the startup handshake, simple and extended queries;
//! - [`ReplicationStream`] polls WAL data and keep-alives and reports
//!   progress with standby status updates;
//! - [`ReplicationClient`] runs a stream on a tokio task behind channels.

#![warn(
    clippy::all,
    clippy::cargo,
    clippy::perf,
    clippy::style,
    clippy::correctness,
    clippy::suspicious
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::multiple_crate_versions
)]

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod lsn;
pub mod protocol;
pub mod replication;

pub use client::{ReplicationClient, ReplicationEvent, ReplicationEventReceiver};
pub use config::{ConnectionConfig, ReplicationConfig, ReplicationMode, ReplicationOptions};
pub use connection::{Connection, ConnectionState, QueryResult, StateTag};
pub use error::{PgWireError, Result};
pub use lsn::{Lsn, ParseLsnError};
pub use replication::{FetchStatus, ReplicationSession, ReplicationStream};
