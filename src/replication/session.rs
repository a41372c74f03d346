use tokio::time::Instant;
use tracing::warn;

use crate::config::ReplicationOptions;
use crate::error::{PgWireError, Result};
use crate::lsn::Lsn;
use crate::protocol::replication::{
    PrimaryKeepAlive, StandbyStatusUpdate, WalData, current_pg_timestamp,
};

/// Bookkeeping of one active replication session.
///
/// Lives inside [`ConnectionState::ReplicationStreaming`](crate::connection::ConnectionState)
/// from the CopyBothResponse until the stream is closed.
#[derive(Debug, Clone)]
pub struct ReplicationSession {
    slot: String,
    requested_lsn: Lsn,
    start_lsn: Lsn,
    end_lsn: Lsn,
    server_clock: i64,
    confirmed_lsn: Option<Lsn>,
    last_data: Option<WalData>,
    last_keepalive: Option<PrimaryKeepAlive>,
    last_reported: Option<(Lsn, Lsn)>,
    last_status_at: Instant,
    end_of_stream: bool,
    pub(crate) copy_done_sent: bool,
    /// Unread body bytes of the current WAL data frame.
    pub(crate) body_remaining: usize,
    pub(crate) options: ReplicationOptions,
}

impl ReplicationSession {
    pub(crate) fn new(slot: &str, requested_lsn: Lsn, options: ReplicationOptions) -> Self {
        Self {
            slot: slot.to_string(),
            requested_lsn,
            start_lsn: requested_lsn,
            end_lsn: Lsn::INVALID,
            server_clock: 0,
            confirmed_lsn: None,
            last_data: None,
            last_keepalive: None,
            last_reported: None,
            last_status_at: Instant::now(),
            end_of_stream: false,
            copy_done_sent: false,
            body_remaining: 0,
            options,
        }
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn requested_lsn(&self) -> Lsn {
        self.requested_lsn
    }

    /// Start position of the last WAL data frame (the requested position
    /// until the first one arrives).
    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    /// Server WAL end from the last keep-alive.
    pub fn end_lsn(&self) -> Lsn {
        self.end_lsn
    }

    pub fn server_clock(&self) -> i64 {
        self.server_clock
    }

    pub fn confirmed_lsn(&self) -> Option<Lsn> {
        self.confirmed_lsn
    }

    pub fn last_data(&self) -> Option<&WalData> {
        self.last_data.as_ref()
    }

    pub fn last_keepalive(&self) -> Option<&PrimaryKeepAlive> {
        self.last_keepalive.as_ref()
    }

    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    pub(crate) fn on_data(&mut self, header: WalData, body_len: usize) {
        self.start_lsn = header.start_lsn;
        self.server_clock = header.server_clock;
        self.last_data = Some(header);
        self.body_remaining = body_len;
    }

    pub(crate) fn on_keepalive(&mut self, ka: PrimaryKeepAlive) -> Result<()> {
        if ka.end_lsn < self.end_lsn {
            return Err(PgWireError::protocol(format!(
                "keep-alive WAL end went backwards: {} -> {}",
                self.end_lsn, ka.end_lsn
            )));
        }
        self.end_lsn = ka.end_lsn;
        self.server_clock = ka.server_clock;
        self.last_keepalive = Some(ka);
        Ok(())
    }

    pub(crate) fn confirm(&mut self, lsn: Lsn) {
        if self.confirmed_lsn.is_none_or(|c| lsn > c) {
            self.confirmed_lsn = Some(lsn);
        }
    }

    pub(crate) fn mark_end_of_stream(&mut self) {
        self.end_of_stream = true;
        self.body_remaining = 0;
    }

    /// Positions derived from the last frames seen, before clamping.
    fn observed_positions(&self) -> (Lsn, Lsn) {
        let written = self.start_lsn.max(self.end_lsn);
        let flushed = self.confirmed_lsn.unwrap_or(self.start_lsn);
        (written, flushed)
    }

    /// `(written, flushed)` positions the next status update reports. Never
    /// below what was already reported.
    pub(crate) fn report_positions(&self) -> (Lsn, Lsn) {
        let (written, flushed) = self.observed_positions();
        match self.last_reported {
            Some((w, f)) => (written.max(w), flushed.max(f)),
            None => (written, flushed),
        }
    }

    /// Build the next status update, or `None` if a non-forced update would
    /// repeat the last one.
    pub(crate) fn status_update(&self, force: bool) -> Option<StandbyStatusUpdate> {
        let positions = self.report_positions();
        let (written, flushed) = self.observed_positions();
        if positions != (written, flushed) {
            warn!(
                %written,
                %flushed,
                reported_written = %positions.0,
                reported_flushed = %positions.1,
                "WAL position went backwards, keeping the reported position"
            );
        }
        if !force && self.last_reported == Some(positions) {
            return None;
        }
        let (written, flushed) = positions;
        Some(StandbyStatusUpdate {
            written,
            flushed,
            applied: flushed,
            client_clock: current_pg_timestamp(),
            reply_requested: false,
        })
    }

    pub(crate) fn mark_reported(&mut self, update: &StandbyStatusUpdate) {
        self.last_reported = Some((update.written, update.flushed));
        self.last_status_at = Instant::now();
    }

    pub(crate) fn status_due(&self) -> bool {
        self.last_status_at.elapsed() >= self.options.status_interval
    }
}
