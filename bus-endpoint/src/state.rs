//! Lifecycle states and exit reasons.

use std::fmt;

/// Where an endpoint is in its lifecycle.
///
/// ```text
/// Created ─▶ Authenticating ─┬─▶ Established ─▶ Stopping ─▶ Stopped
///                            ├─▶ Redirected
///                            └─▶ AuthFailed
/// ```
///
/// `Established` carries a separate draining flag (see
/// [`RemoteEndpoint::is_draining`](crate::endpoint::RemoteEndpoint::is_draining)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointState {
    /// Constructed; only `establish` is legal.
    Created,
    /// The auth handshake is running.
    Authenticating,
    /// The peer was told (or told us) to connect elsewhere.
    Redirected,
    /// The handshake failed; the endpoint is unusable.
    AuthFailed,
    /// Handshake complete; traffic accepted.
    Established,
    /// Shutdown requested; pumps are exiting.
    Stopping,
    /// Both pumps have exited.
    Stopped,
}

impl EndpointState {
    /// Whether `push_message` may enqueue in this state.
    pub fn accepts_traffic(self) -> bool {
        self == Self::Established
    }

    /// Whether the endpoint has reached a state it can never leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Redirected | Self::AuthFailed | Self::Stopped)
    }
}

/// Why an endpoint stopped.
///
/// Set once, by whichever path initiated the shutdown first, and reported to
/// the bus alongside the exit notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// `stop` was called.
    Requested,
    /// The last reference was released via `decrement_ref`.
    ReferencesReleased,
    /// `stop_after_tx_empty` flushed every queued message.
    Drained,
    /// `stop_after_tx_empty` hit its max wait with messages still queued.
    DrainTimedOut,
    /// The peer closed the stream.
    RemoteClosed,
    /// The stream failed.
    StreamError(String),
    /// The link monitor exhausted its probes without an answer.
    LinkTimeout,
    /// The peer sent bytes that do not decode as a message.
    ProtocolViolation(String),
}

impl ExitReason {
    /// Whether this exit was a failure of the link rather than a local
    /// decision.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::RemoteClosed
                | Self::StreamError(_)
                | Self::LinkTimeout
                | Self::ProtocolViolation(_)
        )
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "stop requested"),
            Self::ReferencesReleased => write!(f, "all references released"),
            Self::Drained => write!(f, "tx queue drained"),
            Self::DrainTimedOut => write!(f, "tx drain timed out"),
            Self::RemoteClosed => write!(f, "remote closed the stream"),
            Self::StreamError(e) => write!(f, "stream error: {e}"),
            Self::LinkTimeout => write!(f, "link timeout"),
            Self::ProtocolViolation(e) => write!(f, "protocol violation: {e}"),
        }
    }
}
