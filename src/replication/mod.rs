//! Logical replication streaming.
//!
//! [`Connection::start_replication`] issues START_REPLICATION and returns a
//! [`ReplicationStream`] handle. The handle is polled with
//! [`fetch_next`](ReplicationStream::fetch_next):
//!
//! ```ignore
//! let mut stream = conn.start_replication("slot", Lsn::INVALID, options, &[]).await?;
//! loop {
//!     match stream.fetch_next().await? {
//!         FetchStatus::Data => {
//!             let body = stream.read_data().await?;
//!             apply(&body);
//!             stream.confirm(stream.start_lsn());
//!         }
//!         FetchStatus::KeepAlive | FetchStatus::None => {}
//!         FetchStatus::Closed => break,
//!     }
//!     if stream.status_due() {
//!         stream.flush(true).await?;
//!     }
//! }
//! stream.close().await?;
//! ```
//!
//! Status updates are caller-driven: only a keep-alive that asks for an
//! immediate reply makes `fetch_next` write one on its own.

mod commands;
mod reader;
mod session;

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionState, PgStream, StateTag};
use crate::error::{PgWireError, Result};
use crate::lsn::Lsn;
use crate::protocol::backend::BackendMessage;
use crate::protocol::framing::{HEADER_LEN, PayloadReader, peek_header};
use crate::protocol::frontend::FrontendMessage;
use crate::protocol::replication::{
    KEEPALIVE_LEN, KEEPALIVE_TAG, PrimaryKeepAlive, ReplicationCopyData, WAL_DATA_HEADER_LEN,
    WAL_DATA_TAG, WalData, parse_copy_data,
};

pub use commands::{ReplicationSlot, SystemIdentity, quote_identifier, quote_literal};
pub use reader::WalDataReader;
pub use session::ReplicationSession;

/// Outcome of one [`ReplicationStream::fetch_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Nothing arrived within the poll timeout.
    None,
    /// A WAL data frame; its body is available through `read_data` or
    /// `data_reader`.
    Data,
    /// A primary keep-alive.
    KeepAlive,
    /// The server ended the stream (CopyDone).
    Closed,
}

/// Handle on the active replication session of a connection.
pub struct ReplicationStream<'a, S> {
    conn: &'a mut Connection<S>,
    /// Snapshot of the session once the stream is closed.
    finished: Option<ReplicationSession>,
}

impl<S> std::fmt::Debug for ReplicationStream<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationStream")
            .field("state", &self.conn.state.tag())
            .field("session", &self.session())
            .finish()
    }
}

impl<'a, S> ReplicationStream<'a, S> {
    fn session(&self) -> Option<&ReplicationSession> {
        self.conn.state.session().or(self.finished.as_ref())
    }

    pub fn slot(&self) -> &str {
        self.session().map_or("", ReplicationSession::slot)
    }

    pub fn start_lsn(&self) -> Lsn {
        self.session().map_or(Lsn::INVALID, ReplicationSession::start_lsn)
    }

    pub fn end_lsn(&self) -> Lsn {
        self.session().map_or(Lsn::INVALID, ReplicationSession::end_lsn)
    }

    pub fn server_clock(&self) -> i64 {
        self.session().map_or(0, ReplicationSession::server_clock)
    }

    /// Header of the last WAL data frame.
    pub fn last_data(&self) -> Option<WalData> {
        self.session().and_then(|s| s.last_data().copied())
    }

    pub fn last_keepalive(&self) -> Option<PrimaryKeepAlive> {
        self.session().and_then(|s| s.last_keepalive().copied())
    }

    /// True once the server sent CopyDone or the stream was closed.
    pub fn end_of_stream(&self) -> bool {
        self.finished.is_some() || self.session().is_some_and(ReplicationSession::end_of_stream)
    }

    /// Whether `status_interval` elapsed since the last status update.
    pub fn status_due(&self) -> bool {
        self.conn
            .state
            .session()
            .is_some_and(ReplicationSession::status_due)
    }

    /// Record `lsn` as durably applied by the caller. Reported as the
    /// flushed and applied position by later status updates. Never moves
    /// backwards.
    pub fn confirm(&mut self, lsn: Lsn) {
        if let Some(session) = self.conn.state.session_mut() {
            session.confirm(lsn);
        }
    }
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin> ReplicationStream<'a, S> {
    pub(crate) fn new(conn: &'a mut Connection<S>) -> Self {
        Self {
            conn,
            finished: None,
        }
    }

    /// Poll for the next message, waiting at most the session's poll timeout.
    pub async fn fetch_next(&mut self) -> Result<FetchStatus> {
        let timeout = self
            .conn
            .state
            .session()
            .map_or(Duration::ZERO, |s| s.options.poll_timeout);
        self.fetch_next_timeout(timeout).await
    }

    /// Poll for the next message, waiting at most `timeout`.
    ///
    /// Cancel-safe: a partially received frame stays buffered for the next
    /// call.
    pub async fn fetch_next_timeout(&mut self, timeout: Duration) -> Result<FetchStatus> {
        if self.end_of_stream() {
            return Ok(FetchStatus::Closed);
        }
        self.conn
            .ensure_state("fetch_next", StateTag::ReplicationStreaming)?;
        let deadline = Instant::now() + timeout;
        let res = self.fetch_inner(deadline).await;
        self.conn.check(res)
    }

    async fn fetch_inner(&mut self, deadline: Instant) -> Result<FetchStatus> {
        loop {
            let conn = &mut *self.conn;
            let (Some(stream), Some(session)) = (conn.stream.as_mut(), conn.state.session_mut())
            else {
                return Err(PgWireError::Internal("replication session vanished".into()));
            };

            if session.body_remaining > 0 {
                let n = session.body_remaining.min(stream.buffered().len());
                stream.discard(n);
                session.body_remaining -= n;
                if session.body_remaining > 0 && !stream.fill_until(deadline).await? {
                    return Ok(FetchStatus::None);
                }
                continue;
            }

            let Some((tag, len)) = peek_header(stream.buffered())? else {
                if !stream.fill_until(deadline).await? {
                    return Ok(FetchStatus::None);
                }
                continue;
            };

            if tag == b'd' {
                if len == 0 {
                    return Err(PgWireError::protocol("empty CopyData payload"));
                }
                // the sub-tag decides how much must be buffered
                let Some(&kind) = stream.buffered().get(HEADER_LEN) else {
                    if !stream.fill_until(deadline).await? {
                        return Ok(FetchStatus::None);
                    }
                    continue;
                };
                match kind {
                    WAL_DATA_TAG => {
                        if len < WAL_DATA_HEADER_LEN {
                            return Err(PgWireError::protocol(format!(
                                "XLogData frame of {len} bytes is shorter than its header"
                            )));
                        }
                        if stream.buffered().len() < HEADER_LEN + WAL_DATA_HEADER_LEN {
                            if !stream.fill_until(deadline).await? {
                                return Ok(FetchStatus::None);
                            }
                            continue;
                        }
                        stream.discard(HEADER_LEN + 1);
                        let mut r =
                            PayloadReader::new("XLogData", stream.consume(WAL_DATA_HEADER_LEN - 1));
                        let header = WalData::decode(&mut r)?;
                        r.finish()?;
                        let body_len = len - WAL_DATA_HEADER_LEN;
                        trace!(
                            start = %header.start_lsn,
                            end = %header.end_lsn,
                            body_len,
                            "xlog data"
                        );
                        session.on_data(header, body_len);
                        return Ok(FetchStatus::Data);
                    }
                    KEEPALIVE_TAG => {
                        if len != KEEPALIVE_LEN {
                            return Err(PgWireError::protocol(format!(
                                "keep-alive frame is {len} bytes, expected {KEEPALIVE_LEN}"
                            )));
                        }
                        let Some(frame) = stream.try_frame()? else {
                            if !stream.fill_until(deadline).await? {
                                return Ok(FetchStatus::None);
                            }
                            continue;
                        };
                        let ReplicationCopyData::KeepAlive(ka) = parse_copy_data(frame.payload)?
                        else {
                            return Err(PgWireError::Internal("keep-alive decoded as data".into()));
                        };
                        trace!(end = %ka.end_lsn, reply = ka.reply_immediately, "keep-alive");
                        session.on_keepalive(ka)?;
                        if ka.reply_immediately {
                            send_status(stream, session, true).await?;
                        }
                        return Ok(FetchStatus::KeepAlive);
                    }
                    other => {
                        return Err(PgWireError::protocol(format!(
                            "unknown CopyData kind: 0x{other:02x} ('{}')",
                            other as char
                        )));
                    }
                }
            }

            let Some(frame) = stream.try_frame()? else {
                if !stream.fill_until(deadline).await? {
                    return Ok(FetchStatus::None);
                }
                continue;
            };
            match BackendMessage::from_frame(frame)? {
                BackendMessage::CopyDone => {
                    debug!(slot = session.slot(), "server ended replication stream");
                    session.mark_end_of_stream();
                    return Ok(FetchStatus::Closed);
                }
                BackendMessage::ErrorResponse(fields) => {
                    debug!(error = %fields, "replication stream failed");
                    self.finish_after_error().await?;
                    return Err(PgWireError::Server(fields));
                }
                msg => {
                    if let Some(other) = conn.absorb_async(msg) {
                        return Err(PgWireError::protocol(format!(
                            "unexpected {} during replication",
                            other.name()
                        )));
                    }
                }
            }
        }
    }

    /// Read the whole body of the current WAL data frame.
    ///
    /// Returns an empty buffer if the body was already consumed.
    pub async fn read_data(&mut self) -> Result<Bytes> {
        self.conn
            .ensure_state("read_data", StateTag::ReplicationStreaming)?;
        let res = self.read_data_inner().await;
        self.conn.check(res)
    }

    async fn read_data_inner(&mut self) -> Result<Bytes> {
        let conn = &mut *self.conn;
        let (Some(stream), Some(session)) = (conn.stream.as_mut(), conn.state.session_mut()) else {
            return Err(PgWireError::Internal("replication session vanished".into()));
        };
        let n = session.body_remaining;
        while stream.buffered().len() < n {
            stream.fill().await?;
        }
        session.body_remaining = 0;
        Ok(stream.consume(n))
    }

    /// Stream the body of the current WAL data frame without buffering it.
    pub fn data_reader(&mut self) -> Result<WalDataReader<'_, S>> {
        self.conn
            .ensure_state("data_reader", StateTag::ReplicationStreaming)?;
        let conn = &mut *self.conn;
        match (conn.stream.as_mut(), conn.state.session_mut()) {
            (Some(stream), Some(session)) => {
                Ok(WalDataReader::new(stream, &mut session.body_remaining))
            }
            _ => Err(PgWireError::Internal("replication session vanished".into())),
        }
    }

    /// Send a standby status update.
    ///
    /// Without `force` the update is skipped, returning `false`, when the
    /// reported positions did not change since the last one.
    pub async fn flush(&mut self, force: bool) -> Result<bool> {
        self.conn
            .ensure_state("flush", StateTag::ReplicationStreaming)?;
        let conn = &mut *self.conn;
        let res = match (conn.stream.as_mut(), conn.state.session_mut()) {
            (Some(stream), Some(session)) => send_status(stream, session, force).await,
            _ => Err(PgWireError::Internal("replication session vanished".into())),
        };
        self.conn.check(res)
    }

    /// End the session: send CopyDone, read through ReadyForQuery and return
    /// the connection to `Ready`.
    pub async fn close(&mut self) -> Result<()> {
        if self.finished.is_some() {
            return Ok(());
        }
        self.conn
            .ensure_state("close replication", StateTag::ReplicationStreaming)?;
        let res = self.close_inner().await;
        self.conn.check(res)
    }

    async fn close_inner(&mut self) -> Result<()> {
        let conn = &mut *self.conn;
        let (Some(stream), Some(session)) = (conn.stream.as_mut(), conn.state.session_mut()) else {
            return Err(PgWireError::Internal("replication session vanished".into()));
        };
        // unread body bytes are part of the byte stream, not of any message
        let skip = session.body_remaining.min(stream.buffered().len());
        stream.discard(skip);
        session.body_remaining -= skip;
        while session.body_remaining > 0 {
            stream.fill().await?;
            let skip = session.body_remaining.min(stream.buffered().len());
            stream.discard(skip);
            session.body_remaining -= skip;
        }
        if !session.copy_done_sent {
            stream.send(FrontendMessage::CopyDone);
            stream.flush().await?;
            session.copy_done_sent = true;
        }

        let mut error = None;
        loop {
            match self.conn.recv().await? {
                BackendMessage::CopyData(_) => {}
                BackendMessage::CopyDone => {
                    if let Some(session) = self.conn.state.session_mut() {
                        session.mark_end_of_stream();
                    }
                }
                BackendMessage::CommandComplete { tag } => debug!(%tag, "replication finished"),
                BackendMessage::ErrorResponse(fields) => {
                    error.get_or_insert(fields);
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.conn.transaction_status = status;
                    break;
                }
                other => {
                    return Err(PgWireError::protocol(format!(
                        "unexpected {} while closing replication",
                        other.name()
                    )));
                }
            }
        }
        self.end_session();
        match error {
            Some(fields) => Err(PgWireError::Server(fields)),
            None => Ok(()),
        }
    }

    /// Server reported an error: it leaves copy mode on its own, so only
    /// wait for ReadyForQuery.
    async fn finish_after_error(&mut self) -> Result<()> {
        loop {
            match self.conn.recv().await? {
                BackendMessage::ReadyForQuery(status) => {
                    self.conn.transaction_status = status;
                    break;
                }
                BackendMessage::CopyData(_) | BackendMessage::CopyDone => {}
                BackendMessage::ErrorResponse(fields) => {
                    debug!(error = %fields, "further error after replication failure");
                }
                other => {
                    return Err(PgWireError::protocol(format!(
                        "unexpected {} after replication error",
                        other.name()
                    )));
                }
            }
        }
        self.end_session();
        Ok(())
    }

    fn end_session(&mut self) {
        if let Some(session) = self.conn.state.session_mut() {
            session.mark_end_of_stream();
            debug!(slot = session.slot(), last = %session.start_lsn(), "replication session ended");
        }
        self.finished = self.conn.state.session().cloned();
        self.conn.transition(ConnectionState::Ready);
    }
}

async fn send_status<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut PgStream<S>,
    session: &mut ReplicationSession,
    force: bool,
) -> Result<bool> {
    let Some(update) = session.status_update(force) else {
        return Ok(false);
    };
    stream.send(FrontendMessage::CopyData(&update.encode()));
    stream.flush().await?;
    trace!(
        written = %update.written,
        flushed = %update.flushed,
        force,
        "standby status update"
    );
    session.mark_reported(&update);
    Ok(true)
}
