//! Channel-based logical replication client.
//!
//! [`ReplicationClient`] runs a [`ReplicationStream`](crate::replication::ReplicationStream)
//! on a tokio task and forwards what it reads as [`ReplicationEvent`]s over a
//! bounded channel. Progress flows back through a `watch` channel and is
//! reported to the server in periodic standby status updates.
//!
//! The worker owns its [`Connection`](crate::connection::Connection). It is
//! opened over TCP by [`ReplicationClient::connect`], or handed over by the
//! caller through [`ReplicationClient::spawn_on`] for any other transport.
//! On stop, on reaching `stop_at_lsn`, or when the receiver is dropped, the
//! worker closes the stream and then the connection.
//!
//! # Example
//!
//! ```ignore
//! use pgwire_engine::client::{ReplicationClient, ReplicationEvent};
//! use pgwire_engine::config::{ConnectionConfig, ReplicationConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conn = ConnectionConfig::new("localhost", "replicator", "password", "mydb");
//!     let config = ReplicationConfig::new(conn, "my_slot")
//!         .with_plugin_option("proto_version", "1")
//!         .with_plugin_option("publication_names", "my_publication");
//!
//!     let mut client = ReplicationClient::connect(config).await?;
//!
//!     loop {
//!         let event = client.recv().await?;
//!         match event {
//!             ReplicationEvent::XLogData { data, wal_end, .. } => {
//!                 // Parse and process pgoutput data
//!                 println!("Received {} bytes at {}", data.len(), wal_end);
//!
//!                 // Report progress to allow WAL cleanup
//!                 client.update_applied_lsn(wal_end);
//!             }
//!             ReplicationEvent::KeepAlive { wal_end, .. } => {
//!                 println!("Server heartbeat at {}", wal_end);
//!             }
//!             ReplicationEvent::StoppedAt { reached } => {
//!                 println!("Reached stop LSN {}", reached);
//!                 break;
//!             }
//!             ReplicationEvent::Closed => break,
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

mod tokio_client;
mod worker;

pub use tokio_client::ReplicationClient;
pub use worker::{ReplicationEvent, ReplicationEventReceiver};
