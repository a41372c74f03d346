use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use super::framing::PayloadReader;
use crate::error::{PgWireError, Result};
use crate::lsn::Lsn;

/// CopyData sub-tag of a WAL data message.
pub const WAL_DATA_TAG: u8 = b'w';
/// CopyData sub-tag of a primary keep-alive message.
pub const KEEPALIVE_TAG: u8 = b'k';
/// CopyData sub-tag of a standby status update.
pub const STATUS_UPDATE_TAG: u8 = b'r';

/// Sub-tag (1) + start LSN (8) + end LSN (8) + server clock (8).
/// The replicated payload follows and is not part of the header.
pub const WAL_DATA_HEADER_LEN: usize = 1 + 8 + 8 + 8;
/// Sub-tag (1) + end LSN (8) + server clock (8) + reply flag (1).
pub const KEEPALIVE_LEN: usize = 1 + 8 + 8 + 1;
/// Sub-tag (1) + written/flushed/applied LSN (3 x 8) + client clock (8) + reply flag (1).
pub const STATUS_UPDATE_LEN: usize = 1 + 8 * 3 + 8 + 1;

/// Header of an XLogData message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalData {
    /// WAL position where this data starts
    pub start_lsn: Lsn,
    /// Current end of WAL on the server (may be 0 for in-transaction messages)
    pub end_lsn: Lsn,
    /// Server clock in microseconds since 2000-01-01
    pub server_clock: i64,
}

impl WalData {
    /// Decode the fields following the `w` sub-tag.
    pub fn decode(r: &mut PayloadReader) -> Result<WalData> {
        let start_lsn = read_lsn(r)?;
        let end_lsn = read_lsn(r)?;
        let server_clock = r.i64()?;
        if end_lsn.is_valid() && start_lsn > end_lsn {
            return Err(PgWireError::protocol(format!(
                "XLogData start {start_lsn} is past WAL end {end_lsn}"
            )));
        }
        Ok(WalData {
            start_lsn,
            end_lsn,
            server_clock,
        })
    }
}

/// Primary keep-alive (server heartbeat).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryKeepAlive {
    /// Current end of WAL on the server
    pub end_lsn: Lsn,
    /// Server clock in microseconds since 2000-01-01
    pub server_clock: i64,
    /// The server expects a status update as soon as possible, to avoid a
    /// timeout disconnect.
    pub reply_immediately: bool,
}

impl PrimaryKeepAlive {
    /// Decode the fields following the `k` sub-tag. The reply flag must be
    /// exactly 0 or 1.
    pub fn decode(r: &mut PayloadReader) -> Result<PrimaryKeepAlive> {
        let end_lsn = read_lsn(r)?;
        let server_clock = r.i64()?;
        let reply_immediately = match r.u8()? {
            0 => false,
            1 => true,
            other => return Err(PgWireError::InvalidKeepAliveFlag(other)),
        };
        Ok(PrimaryKeepAlive {
            end_lsn,
            server_clock,
            reply_immediately,
        })
    }
}

fn read_lsn(r: &mut PayloadReader) -> Result<Lsn> {
    let upper = r.u32()?;
    let lower = r.u32()?;
    Ok(Lsn::new(upper, lower))
}

/// A fully buffered CopyData message of the replication sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationCopyData {
    XLogData { header: WalData, data: Bytes },
    KeepAlive(PrimaryKeepAlive),
}

impl ReplicationCopyData {
    #[inline]
    pub fn is_xlog_data(&self) -> bool {
        matches!(self, ReplicationCopyData::XLogData { .. })
    }

    #[inline]
    pub fn is_keepalive(&self) -> bool {
        matches!(self, ReplicationCopyData::KeepAlive(_))
    }

    /// Returns true if this is a KeepAlive that requests a reply
    #[inline]
    pub fn requires_reply(&self) -> bool {
        matches!(
            self,
            ReplicationCopyData::KeepAlive(PrimaryKeepAlive {
                reply_immediately: true,
                ..
            })
        )
    }
}

/// Parse a whole CopyData payload (after stripping the `d` tag and length).
pub fn parse_copy_data(payload: Bytes) -> Result<ReplicationCopyData> {
    let mut r = PayloadReader::new("CopyData", payload);
    if r.remaining() == 0 {
        return Err(PgWireError::protocol("empty CopyData payload"));
    }
    match r.u8()? {
        WAL_DATA_TAG => {
            let mut r = PayloadReader::new("XLogData", r.rest());
            let header = WalData::decode(&mut r)?;
            Ok(ReplicationCopyData::XLogData {
                header,
                data: r.rest(),
            })
        }
        KEEPALIVE_TAG => {
            let mut r = PayloadReader::new("KeepAlive", r.rest());
            let ka = PrimaryKeepAlive::decode(&mut r)?;
            r.finish()?;
            Ok(ReplicationCopyData::KeepAlive(ka))
        }
        kind => Err(PgWireError::protocol(format!(
            "unknown CopyData kind: 0x{kind:02x} ('{}')",
            kind as char
        ))),
    }
}

/// Standby status update, reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    /// Last WAL position received and written.
    pub written: Lsn,
    /// Last WAL position durably stored by the client.
    pub flushed: Lsn,
    /// Last WAL position applied by the client.
    pub applied: Lsn,
    /// Client clock in microseconds since 2000-01-01
    pub client_clock: i64,
    /// Ask the server to answer with a keep-alive right away.
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    /// CopyData body of the update (34 bytes).
    pub fn encode(&self) -> [u8; STATUS_UPDATE_LEN] {
        let mut out = [0u8; STATUS_UPDATE_LEN];
        out[0] = STATUS_UPDATE_TAG;
        out[1..9].copy_from_slice(&self.written.as_u64().to_be_bytes());
        out[9..17].copy_from_slice(&self.flushed.as_u64().to_be_bytes());
        out[17..25].copy_from_slice(&self.applied.as_u64().to_be_bytes());
        out[25..33].copy_from_slice(&self.client_clock.to_be_bytes());
        out[33] = u8::from(self.reply_requested);
        out
    }
}

/// Encode a status update that reports `applied` for all three positions.
pub fn encode_standby_status_update(
    applied: Lsn,
    client_time_micros: i64,
    reply_requested: bool,
) -> [u8; STATUS_UPDATE_LEN] {
    StandbyStatusUpdate {
        written: applied,
        flushed: applied,
        applied,
        client_clock: client_time_micros,
        reply_requested,
    }
    .encode()
}

/// PostgreSQL epoch (2000-01-01) in microseconds since Unix epoch.
pub const PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

/// Convert Unix timestamp (micros) to PostgreSQL timestamp (micros since 2000-01-01).
#[inline]
pub fn unix_to_pg_timestamp(unix_micros: i64) -> i64 {
    unix_micros - PG_EPOCH_MICROS
}

/// Convert PostgreSQL timestamp to Unix timestamp (micros).
#[inline]
pub fn pg_to_unix_timestamp(pg_micros: i64) -> i64 {
    pg_micros + PG_EPOCH_MICROS
}

/// Current wall clock as a PostgreSQL timestamp.
pub fn current_pg_timestamp() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    unix_to_pg_timestamp(now.as_micros() as i64)
}
