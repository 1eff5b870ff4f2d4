//! Configuration for a remote bus endpoint.

use {
    crate::error::{EndpointError, Result},
    serde::{Deserialize, Serialize},
    std::time::Duration,
};

/// Configuration for one remote endpoint.
///
/// Controls link-liveness tuning, authentication limits, outbound
/// backpressure, and the feature set requested from the peer. Every field
/// has a default, so a config file only needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Seconds of inbound silence before a ProbeReq is sent.
    /// `0` disables the link monitor.
    pub idle_timeout_secs: u32,

    /// Seconds to wait for a ProbeAck before counting the probe as failed.
    pub probe_timeout_secs: u32,

    /// Number of unanswered ProbeReqs after which the link is declared dead.
    pub max_idle_probes: u32,

    /// Lower bound applied by `set_link_timeout` to a user-supplied link
    /// timeout.
    pub min_link_timeout_secs: u32,

    /// How long to wait for each handshake frame from the peer (ms).
    pub auth_timeout_ms: u64,

    /// Mechanism attempts allowed before authentication gives up.
    pub max_auth_attempts: u16,

    /// Maximum size of a single serialized message in bytes.
    pub max_message_size: usize,

    /// Queue depth above which `push_message` blocks the caller.
    /// `0` means unbounded.
    pub tx_high_water_mark: usize,

    /// Longest a producer may be blocked by backpressure before
    /// `push_message` gives up (ms).
    pub push_timeout_ms: u64,

    /// Upper bound on how long the rx pump waits on the stream before
    /// re-checking the exit flag and the link monitor (ms).
    pub rx_poll_interval_ms: u64,

    /// Base name for the rx/tx pump threads (kept short: Linux truncates
    /// thread names to 15 bytes).
    pub thread_name_prefix: String,

    /// Ask for (outgoing) or accept (incoming) a bus-to-bus connection.
    pub bus_to_bus: bool,

    /// Whether this side wants messages from remote buses.
    pub allow_remote: bool,

    /// Whether this side is willing to pass OS handles over the link.
    pub handle_passing: bool,

    /// When set on an incoming endpoint, the handshake redirects the peer
    /// to this connect spec instead of accepting it.
    pub redirection_address: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 0,
            probe_timeout_secs: 10,
            max_idle_probes: 3,
            min_link_timeout_secs: 40,
            auth_timeout_ms: 32_768,
            max_auth_attempts: 4,
            max_message_size: 1_048_576, // 1 MB
            tx_high_water_mark: 1_024,
            push_timeout_ms: 30_000,
            rx_poll_interval_ms: 250,
            thread_name_prefix: "busEp".to_string(),
            bus_to_bus: false,
            allow_remote: false,
            handle_passing: false,
            redirection_address: None,
        }
    }
}

impl EndpointConfig {
    /// Create a config suitable for local testing with shorter timeouts.
    pub fn dev_default() -> Self {
        Self {
            min_link_timeout_secs: 1,
            auth_timeout_ms: 2_000,
            tx_high_water_mark: 64,
            push_timeout_ms: 1_000,
            rx_poll_interval_ms: 20,
            ..Self::default()
        }
    }

    /// Check the config for values the endpoint cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(EndpointError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.idle_timeout_secs > 0 && self.probe_timeout_secs == 0 {
            return invalid("probe_timeout_secs must be non-zero when the link monitor is enabled");
        }
        if self.idle_timeout_secs > 0 && self.max_idle_probes == 0 {
            return invalid("max_idle_probes must be non-zero when the link monitor is enabled");
        }
        if self.max_auth_attempts == 0 {
            return invalid("max_auth_attempts must be at least 1");
        }
        if self.max_message_size == 0 {
            return invalid("max_message_size must be non-zero");
        }
        if self.rx_poll_interval_ms == 0 {
            return invalid("rx_poll_interval_ms must be non-zero");
        }
        if self.auth_timeout_ms == 0 {
            return invalid("auth_timeout_ms must be non-zero");
        }
        if self.thread_name_prefix.is_empty() {
            return invalid("thread_name_prefix must not be empty");
        }
        Ok(())
    }

    pub(crate) fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub(crate) fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub(crate) fn rx_poll_interval(&self) -> Duration {
        Duration::from_millis(self.rx_poll_interval_ms)
    }
}
