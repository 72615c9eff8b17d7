//! Per-attempt connection configuration.
//!
//! Version and ALPN live here rather than in process-wide state: Version
//! Negotiation and Retry mutate this struct only, so several connections
//! can coexist with different versions.

#![forbid(unsafe_code)]

use crate::transport::TransportParameters;
use crate::types::{ConnectionId, Side, DEFAULT_MTU};
use crate::version::{alpn_for_version, VersionRange, DEFAULT_VERSION};
use bytes::Bytes;

/// Connection Configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub side: Side,

    /// Version used for long headers and Initial key derivation
    pub version: u32,

    /// ALPN offered to TLS
    pub alpn: String,

    /// Keep `alpn` when the version changes
    pub fixed_alpn: bool,

    /// Versions accepted during negotiation
    pub versions: VersionRange,

    /// Pads Initial packets to the IPv6 minimum instead of IPv4
    pub ipv6: bool,

    /// Our connection id (peer's destination)
    pub scid: ConnectionId,

    /// Peer's connection id (our destination)
    pub dcid: ConnectionId,

    /// Address validation token echoed in Initial packets
    pub token: Bytes,

    /// Local transport parameters sent to the peer
    pub transport_parameters: TransportParameters,

    /// Don't extend receive credit as data arrives
    pub dont_slide_credit_window: bool,

    pub mtu: usize,
}

impl ConnectionConfig {
    /// Client configuration with the default version and its ALPN
    pub fn client(scid: ConnectionId, dcid: ConnectionId) -> Self {
        Self {
            side: Side::Client,
            version: DEFAULT_VERSION,
            alpn: alpn_for_version(DEFAULT_VERSION),
            fixed_alpn: false,
            versions: VersionRange::default(),
            ipv6: false,
            scid,
            dcid,
            token: Bytes::new(),
            transport_parameters: TransportParameters::default(),
            dont_slide_credit_window: false,
            mtu: DEFAULT_MTU,
        }
    }

    /// Server configuration answering a client's first Initial packet
    pub fn server(scid: ConnectionId, dcid: ConnectionId) -> Self {
        Self {
            side: Side::Server,
            ..Self::client(scid, dcid)
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        if !self.fixed_alpn {
            self.alpn = alpn_for_version(version);
        }
        self
    }

    /// Pin the ALPN across version changes
    pub fn with_alpn(mut self, alpn: impl Into<String>) -> Self {
        self.alpn = alpn.into();
        self.fixed_alpn = true;
        self
    }

    /// Switch to `version`, deriving the ALPN unless it is pinned
    pub fn set_version(&mut self, version: u32) {
        self.version = version;
        if !self.fixed_alpn {
            self.alpn = alpn_for_version(version);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::DRAFT_12;

    #[test]
    fn test_alpn_follows_version_unless_pinned() {
        let mut config = ConnectionConfig::client(ConnectionId::empty(), ConnectionId::empty());
        assert_eq!(config.alpn, "hq-13");
        config.set_version(DRAFT_12);
        assert_eq!(config.alpn, "hq-12");

        let mut pinned = config.clone().with_alpn("h3-12");
        pinned.set_version(DRAFT_12);
        assert_eq!(pinned.alpn, "h3-12");
        assert_eq!(pinned.version, DRAFT_12);
    }
}
