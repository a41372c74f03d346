//! PostgreSQL wire protocol implementation.
//!
//! This module provides low-level primitives for:
//! - Splitting frames out of a read buffer and writing the startup packet ([`framing`])
//! - Encoding frontend messages ([`frontend`])
//! - Decoding backend messages ([`backend`])
//! - Parsing error and notice fields ([`messages`])
//! - Handling streaming replication protocol messages ([`replication`])
//!
//! # Wire Protocol Overview
//!
//! PostgreSQL uses a message-based protocol where each message consists of:
//! - 1 byte: message type tag
//! - 4 bytes: message length (including these 4 bytes)
//! - N bytes: message payload
//!
//! Exception: the startup message omits the type tag.
//!
//! # Replication Protocol
//!
//! During logical replication, the server sends CopyData messages containing
//! either `XLogData` (WAL changes) or `KeepAlive` (heartbeats). The client
//! responds with `StandbyStatusUpdate` messages to report replay progress.

pub mod backend;
pub mod framing;
pub mod frontend;
pub mod messages;
pub mod replication;

pub use backend::BackendMessage;
pub use framing::Frame;
pub use frontend::FrontendMessage;
pub use messages::{ErrorFields, parse_error_response};
pub use replication::{
    PG_EPOCH_MICROS, PrimaryKeepAlive, ReplicationCopyData, StandbyStatusUpdate, WalData,
    encode_standby_status_update, parse_copy_data, pg_to_unix_timestamp, unix_to_pg_timestamp,
};
