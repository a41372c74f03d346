//! Error types for pgwire-engine.
//!
//! All errors in this crate are represented by [`PgWireError`]. The variants
//! fall in two groups:
//! - fatal errors (transport failures, framing errors, a corrupt keep-alive
//!   flag, authentication failures) after which the byte stream can no longer
//!   be trusted; the connection moves to `Broken` and releases its stream;
//! - recoverable errors (malformed LSN text, server error responses, an
//!   operation issued in the wrong state) that leave the connection as it was.

use thiserror::Error;

use crate::connection::StateTag;
use crate::lsn::ParseLsnError;
use crate::protocol::messages::ErrorFields;

/// Error type for all pgwire-engine operations.
#[derive(Debug, Error, Clone)]
pub enum PgWireError {
    /// Transport failure on the underlying stream.
    ///
    /// Note: `std::io::Error` is not `Clone`, so we store the message.
    #[error("io error: {0}")]
    Io(String),

    /// Framing error - declared length disagrees with the decoded layout, or a
    /// message arrived that is not legal in the current state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The reply-immediately byte of a primary keep-alive was neither 0 nor 1.
    #[error("invalid reply-immediately flag in primary keep-alive: {0}")]
    InvalidKeepAliveFlag(u8),

    /// Malformed textual LSN.
    #[error(transparent)]
    LsnFormat(#[from] ParseLsnError),

    /// Server error - PostgreSQL returned an error response.
    #[error("server error: {0}")]
    Server(ErrorFields),

    /// Authentication error - wrong credentials or unsupported method.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Operation attempted on a closed or broken connection.
    #[error("connection is unusable ({0})")]
    ConnectionUnusable(StateTag),

    /// Operation not legal in the connection's current state.
    #[error("cannot {op} while connection is {state}")]
    InvalidState { op: &'static str, state: StateTag },

    /// Task error - worker panicked or terminated unexpectedly.
    #[error("task error: {0}")]
    Task(String),

    /// Internal error - bug in the library.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PgWireError {
    /// Returns `true` if this is an I/O error.
    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self, PgWireError::Io(_))
    }

    /// Returns `true` if this is a server error.
    #[inline]
    pub fn is_server(&self) -> bool {
        matches!(self, PgWireError::Server(_))
    }

    /// Returns `true` if this is an authentication error.
    #[inline]
    pub fn is_auth(&self) -> bool {
        matches!(self, PgWireError::Auth(_))
    }

    /// Returns `true` for errors after which the stream alignment can no
    /// longer be trusted. A connection observing one of these is broken.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgWireError::Io(_)
                | PgWireError::Protocol(_)
                | PgWireError::InvalidKeepAliveFlag(_)
                | PgWireError::Auth(_)
        )
    }

    /// Returns `true` if this error is likely transient and retryable
    /// on a fresh connection.
    pub fn is_transient(&self) -> bool {
        matches!(self, PgWireError::Io(_) | PgWireError::Task(_))
    }

    /// SQLSTATE of a server error, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            PgWireError::Server(fields) => fields.code.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        PgWireError::Protocol(msg.into())
    }
}

// Manual From impl since io::Error isn't Clone
impl From<std::io::Error> for PgWireError {
    fn from(err: std::io::Error) -> Self {
        PgWireError::Io(err.to_string())
    }
}

/// Result type alias for pgwire-engine operations.
pub type Result<T> = std::result::Result<T, PgWireError>;
