//! Listener session state machine
//!
//! Attaching is `ListenerSession::attach` itself; a session exists from
//! the moment it holds a segment reference.
//!
//! ```text
//!   attach() ──► Draining ──► Advancing ──┐
//!                  ▲  │ └───► Resuming ───┤
//!                  │  └─────► Closed      │
//!                  └──────────────────────┘
//! ```

/// Listener session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerPhase {
    /// Writing buffered bytes or waiting for more
    Draining,
    /// Moving from a finished segment to its successor
    Advancing,
    /// Restarting the upstream fetch after a break
    Resuming,
    /// Detached from the channel
    Closed,
}

impl ListenerPhase {
    /// Whether the session still holds channel references
    pub fn is_attached(&self) -> bool {
        !matches!(self, ListenerPhase::Closed)
    }
}

/// Why a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Downstream write failed or the caller closed the session
    Disconnected,
    /// The channel was torn down or failed
    ChannelClosed,
    /// Origin exhausted and every buffered byte was delivered
    EndOfStream,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Disconnected => write!(f, "listener disconnected"),
            CloseReason::ChannelClosed => write!(f, "channel closed"),
            CloseReason::EndOfStream => write!(f, "end of stream"),
        }
    }
}
