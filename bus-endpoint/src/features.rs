//! Values negotiated once during authentication.

use {
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// Bus protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 3;

/// Oldest remote protocol version that understands ProbeReq/ProbeAck.
pub const MIN_LINK_PROBE_PROTOCOL_VERSION: u32 = 3;

/// Capabilities negotiated with the peer.
///
/// Before establishment an endpoint reports the features it *requests*
/// (from its config); once established the negotiated value is frozen and
/// never mutated again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    /// Connection is between two bus daemons rather than app and daemon.
    pub is_bus_to_bus: bool,
    /// The remote side is willing to receive messages from remote buses.
    pub allow_remote: bool,
    /// OS handle passing is enabled on this link (same-device peers only).
    pub handle_passing: bool,
    /// Bus protocol version of the remote side.
    pub protocol_version: u32,
    /// Numeric library version of the remote side; see [`numeric_version`].
    pub library_version: u32,
    /// Process id reported by the remote side.
    pub process_id: u32,
    /// Whether the remote side authenticated with a trusted mechanism.
    pub trusted: bool,
}

impl Features {
    /// Whether the remote side can take part in the link-probe protocol.
    pub fn supports_link_probes(&self) -> bool {
        self.protocol_version >= MIN_LINK_PROBE_PROTOCOL_VERSION
    }
}

/// Pack `major.minor.patch` into one comparable `u32`
/// (`major:8 | minor:8 | patch:16`).
pub fn numeric_version(major: u8, minor: u8, patch: u16) -> u32 {
    let [patch_hi, patch_lo] = patch.to_be_bytes();
    u32::from_be_bytes([major, minor, patch_hi, patch_lo])
}

/// Numeric version of this crate.
pub fn library_version() -> u32 {
    numeric_version(
        env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
    )
}

/// 128-bit globally unique identifier of a bus instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guid128(pub [u8; 16]);

impl Guid128 {
    /// Generate a random GUID.
    pub fn new_random() -> Self {
        Self(rand::random())
    }

    /// The all-zero GUID reported before establishment.
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// First eight hex digits, used to build unique names.
    pub fn short_string(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Guid128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_version_orders_like_semver() {
        assert!(numeric_version(4, 0, 0) > numeric_version(3, 255, 65_535));
        assert!(numeric_version(2, 5, 1) > numeric_version(2, 5, 0));
        assert_eq!(numeric_version(2, 5, 0), 0x0205_0000);
    }

    #[test]
    fn test_guid_formatting() {
        let guid = Guid128([0xab; 16]);
        assert_eq!(guid.to_string().len(), 32);
        assert_eq!(guid.short_string(), "abababab");
        assert!(Guid128::default().is_nil());
        assert!(!Guid128::new_random().is_nil());
    }

    #[test]
    fn test_probe_support_by_version() {
        let mut features = Features::default();
        assert!(!features.supports_link_probes());
        features.protocol_version = PROTOCOL_VERSION;
        assert!(features.supports_link_probes());
    }
}
