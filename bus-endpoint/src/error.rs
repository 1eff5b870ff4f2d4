//! Error types for the remote bus endpoint.

use {crate::state::EndpointState, thiserror::Error};

/// Failures of the connection-level authentication handshake.
///
/// All of these are terminal for the connection attempt: the endpoint moves
/// to [`EndpointState::AuthFailed`] and can never be started.
#[derive(Error, Debug)]
pub enum AuthError {
    /// None of the caller's mechanisms is supported by both sides.
    #[error("no mutually supported auth mechanism (offered: {offered})")]
    NoCommonMechanism {
        /// Space-separated list that was offered.
        offered: String,
    },

    /// The mechanism list passed to `establish` named nothing we know.
    #[error("unknown auth mechanism: {0}")]
    UnknownMechanism(String),

    /// The peer (or our auth listener) rejected the presented credentials.
    #[error("credentials rejected for mechanism {0}")]
    Rejected(String),

    /// The mechanism needs credentials and the auth listener supplied none.
    #[error("no credentials available for mechanism {0}")]
    CredentialsUnavailable(String),

    /// The peer sent a frame that does not belong at this point of the exchange.
    #[error("auth protocol violation: {0}")]
    Protocol(String),

    /// The peer did not answer within the configured auth timeout.
    #[error("timed out after {0}ms waiting for peer during authentication")]
    Timeout(u64),

    /// The peer closed the stream mid-handshake.
    #[error("stream closed during authentication")]
    StreamClosed,

    /// The client exhausted `max_auth_attempts`.
    #[error("too many authentication attempts ({0})")]
    TooManyAttempts(u16),

    /// The peer reported a failure of its own.
    #[error("peer aborted authentication: {0}")]
    PeerAborted(String),
}

/// Errors returned synchronously by [`RemoteEndpoint`](crate::endpoint::RemoteEndpoint)
/// operations.
#[derive(Error, Debug)]
pub enum EndpointError {
    /// Authentication failed; the endpoint is unusable.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// `establish` was called on an endpoint that already left `Created`.
    #[error("endpoint already established or establishing (state: {0:?})")]
    AlreadyEstablished(EndpointState),

    /// `start` was called twice.
    #[error("endpoint already started")]
    AlreadyStarted,

    /// The operation is not legal in the endpoint's current state.
    #[error("endpoint not running (state: {0:?})")]
    NotRunning(EndpointState),

    /// The outbound queue stayed above its high-water mark for the whole
    /// push timeout.
    #[error("outbound queue above high-water mark for {0}ms")]
    Backpressure(u64),

    /// Failed to serialize a message or handshake frame.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Message exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Stream-level I/O error.
    #[error("stream error: {0}")]
    Stream(#[from] std::io::Error),

    /// The peer's protocol version does not support the requested feature.
    #[error("not supported by remote protocol version {0}")]
    NotSupported(u32),

    /// The configuration is invalid.
    #[error("invalid endpoint configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with it.
        reason: String,
    },
}

/// Convenience result type for endpoint operations.
pub type Result<T> = std::result::Result<T, EndpointError>;
