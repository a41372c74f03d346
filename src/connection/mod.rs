//! Connection state machine.
//!
//! A [`Connection`] owns a [`PgStream`] and exactly one [`ConnectionState`]:
//!
//! ```text
//! Connecting ──► Ready ◄──► ReplicationStreaming
//!      │           │               │
//!      └───────────┴───────────────┴──► Closed | Broken
//! ```
//!
//! Every operation checks the current state before touching the stream.
//! Fatal errors (transport failures, framing errors, authentication failures)
//! move the connection to `Broken` and release the stream. A server error
//! response leaves the connection `Ready`.

mod query;
mod startup;
mod state;
mod stream;

use std::collections::{HashMap, VecDeque};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::error::{PgWireError, Result};
use crate::protocol::backend::{BackendKeyData, BackendMessage, TransactionStatus};

pub use query::QueryResult;
pub use state::{ConnectionState, StateTag};
pub use stream::PgStream;

pub(crate) use query::Pending;

/// A single PostgreSQL session over any duplex byte stream.
pub struct Connection<S> {
    pub(crate) stream: Option<PgStream<S>>,
    pub(crate) state: ConnectionState,
    pub(crate) parameters: HashMap<String, String>,
    pub(crate) backend_key: Option<BackendKeyData>,
    pub(crate) transaction_status: TransactionStatus,
    pub(crate) protocol_minor: i32,
    /// Replies owed by the server for queued extended-query messages.
    pub(crate) pending: VecDeque<Pending>,
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state.tag())
            .field("transaction_status", &self.transaction_status)
            .field("backend_key", &self.backend_key)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub(crate) fn new(io: S) -> Self {
        Self {
            stream: Some(PgStream::new(io)),
            state: ConnectionState::Connecting,
            parameters: HashMap::new(),
            backend_key: None,
            transaction_status: TransactionStatus::Idle,
            protocol_minor: 0,
            pending: VecDeque::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> StateTag {
        self.state.tag()
    }

    /// Whether the connection can still be used for requests.
    #[inline]
    pub fn is_usable(&self) -> bool {
        !self.state.tag().is_terminal()
    }

    /// Run-time parameter reported by the server (`server_version`,
    /// `client_encoding`, ...). Updated whenever a ParameterStatus arrives.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn backend_key(&self) -> Option<BackendKeyData> {
        self.backend_key
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// `(major, minor)` protocol version in use. The minor version is
    /// lowered when the server sends NegotiateProtocolVersion.
    pub fn protocol_version(&self) -> (i32, i32) {
        (3, self.protocol_minor)
    }

    /// Borrow the stream, failing if it was released.
    pub(crate) fn io(&mut self) -> Result<&mut PgStream<S>> {
        let state = self.state.tag();
        self.stream
            .as_mut()
            .ok_or(PgWireError::ConnectionUnusable(state))
    }

    /// Fail unless the connection is in `expected`.
    pub(crate) fn ensure_state(&self, op: &'static str, expected: StateTag) -> Result<()> {
        let state = self.state.tag();
        if state == expected {
            Ok(())
        } else if state.is_terminal() {
            Err(PgWireError::ConnectionUnusable(state))
        } else {
            Err(PgWireError::InvalidState { op, state })
        }
    }

    pub(crate) fn transition(&mut self, next: ConnectionState) {
        let from = self.state.tag();
        let to = next.tag();
        debug_assert!(
            ConnectionState::can_transition(from, to),
            "illegal transition {from} -> {to}"
        );
        if from != to {
            debug!(%from, %to, "connection state change");
        }
        self.state = next;
        if to.is_terminal() {
            self.stream = None;
            self.pending.clear();
        }
    }

    /// Move to `Broken` if `res` carries a fatal error.
    pub(crate) fn check<T>(&mut self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res
            && e.is_fatal()
            && !self.state.tag().is_terminal()
        {
            warn!(error = %e, state = %self.state.tag(), "connection broken");
            self.transition(ConnectionState::Broken);
        }
        res
    }

    /// Next message that is not asynchronous.
    ///
    /// ParameterStatus, NoticeResponse and NotificationResponse may arrive in
    /// any state; they are absorbed here.
    pub(crate) async fn recv(&mut self) -> Result<BackendMessage> {
        loop {
            let msg = self.io()?.read_message().await?;
            if let Some(msg) = self.absorb_async(msg) {
                return Ok(msg);
            }
        }
    }

    pub(crate) fn absorb_async(&mut self, msg: BackendMessage) -> Option<BackendMessage> {
        match msg {
            BackendMessage::ParameterStatus { name, value } => {
                debug!(%name, %value, "parameter status");
                self.parameters.insert(name, value);
                None
            }
            BackendMessage::NoticeResponse(fields) => {
                debug!(notice = %fields, "server notice");
                None
            }
            BackendMessage::NotificationResponse(n) => {
                debug!(channel = %n.channel, pid = n.process_id, "notification");
                None
            }
            other => Some(other),
        }
    }

    /// Close the connection.
    ///
    /// Sends Terminate on a best-effort basis: a failed write is logged and
    /// ignored. Never fails; afterwards the state is `Closed` (or stays
    /// `Broken`) and every other operation reports `ConnectionUnusable`.
    pub async fn close(&mut self) {
        if self.state.tag().is_terminal() {
            self.stream = None;
            return;
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.send(crate::protocol::frontend::FrontendMessage::Terminate);
            if let Err(e) = stream.flush().await {
                debug!(error = %e, "terminate not delivered");
            } else if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "shutdown failed");
            }
        }
        self.transition(ConnectionState::Closed);
    }
}

impl Connection<tokio::net::TcpStream> {
    /// Open a TCP connection and run the startup handshake, bounded by
    /// `config.connect_timeout`.
    pub async fn connect(config: &crate::config::ConnectionConfig) -> Result<Self> {
        let connect = async {
            let tcp = tokio::net::TcpStream::connect((config.host.as_str(), config.port)).await?;
            tcp.set_nodelay(true)?;
            Connection::handshake(tcp, config).await
        };
        tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| {
                PgWireError::Io(format!(
                    "connect to {}:{} timed out after {:?}",
                    config.host, config.port, config.connect_timeout
                ))
            })?
    }
}
