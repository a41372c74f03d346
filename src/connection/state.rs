use std::fmt;

use crate::replication::ReplicationSession;

/// Name of a connection state, without the state's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateTag {
    Connecting,
    Ready,
    ReplicationStreaming,
    Closed,
    Broken,
}

impl StateTag {
    /// `Closed` and `Broken` are terminal: nothing leaves them.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, StateTag::Closed | StateTag::Broken)
    }
}

impl fmt::Display for StateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StateTag::Connecting => "connecting",
            StateTag::Ready => "ready",
            StateTag::ReplicationStreaming => "replication streaming",
            StateTag::Closed => "closed",
            StateTag::Broken => "broken",
        })
    }
}

/// State of a [`Connection`](super::Connection). Exactly one is active.
#[derive(Debug)]
pub enum ConnectionState {
    /// Startup and authentication in progress.
    Connecting,
    /// Idle, accepting request/response cycles.
    Ready,
    /// A START_REPLICATION was accepted; the session lives here until closed.
    ReplicationStreaming(ReplicationSession),
    /// Closed on request. The stream is released.
    Closed,
    /// Closed after a fatal error. The stream is released.
    Broken,
}

impl ConnectionState {
    pub fn tag(&self) -> StateTag {
        match self {
            ConnectionState::Connecting => StateTag::Connecting,
            ConnectionState::Ready => StateTag::Ready,
            ConnectionState::ReplicationStreaming(_) => StateTag::ReplicationStreaming,
            ConnectionState::Closed => StateTag::Closed,
            ConnectionState::Broken => StateTag::Broken,
        }
    }

    /// Legal transitions of the state machine.
    pub fn can_transition(from: StateTag, to: StateTag) -> bool {
        use StateTag::*;
        match (from, to) {
            (Closed | Broken, _) => false,
            (_, Broken | Closed) => true,
            (Connecting, Ready) => true,
            (Ready, Ready | ReplicationStreaming) => true,
            (ReplicationStreaming, Ready) => true,
            _ => false,
        }
    }

    pub(crate) fn session_mut(&mut self) -> Option<&mut ReplicationSession> {
        match self {
            ConnectionState::ReplicationStreaming(session) => Some(session),
            _ => None,
        }
    }

    pub(crate) fn session(&self) -> Option<&ReplicationSession> {
        match self {
            ConnectionState::ReplicationStreaming(session) => Some(session),
            _ => None,
        }
    }
}
