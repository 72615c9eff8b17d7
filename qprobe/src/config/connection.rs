//! Connection attempt configuration.
//!
//! Describes the server to probe and how the first connection attempt
//! presents itself: versions, ALPN, connection id lengths and the transport
//! parameters announced through TLS. Converted into a
//! [`qprobe_quic::ConnectionConfig`] per attempt; negotiation later mutates
//! that copy, never these settings.

use anyhow::{Context, Result};
use qprobe_quic::transport::TransportParameters;
use qprobe_quic::types::{ConnectionId, MAX_CID_LENGTH};
use qprobe_quic::version::{MAX_SUPPORTED_VERSION, MIN_SUPPORTED_VERSION};
use qprobe_quic::{ConnectionConfig, VersionRange, DEFAULT_VERSION};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};

/// Shortest destination id a client may pick for its first Initial packet
pub const MIN_INITIAL_DCID_LENGTH: usize = 8;

/// Target server and first-attempt parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Server host name or address.
    ///
    /// **Default:** `"127.0.0.1"`
    pub host: String,

    /// Server UDP port.
    ///
    /// **Default:** `4433`
    pub port: u16,

    /// Server name sent in the TLS handshake; the host when empty.
    pub sni: String,

    /// Connect over IPv6 (also selects the 1232-byte Initial padding).
    ///
    /// **Default:** `false`
    pub ipv6: bool,

    /// Version of the first Initial packet.
    ///
    /// **Default:** `0xff00000d` (draft 13)
    pub initial_version: u32,

    /// Lowest version accepted from a Version Negotiation packet.
    pub min_version: u32,

    /// Highest version accepted from a Version Negotiation packet.
    pub max_version: u32,

    /// ALPN pinned across version changes; derived from the version when unset.
    pub alpn: Option<String>,

    /// Length of our connection id.
    ///
    /// **Default:** `8`
    pub scid_len: usize,

    /// Length of the random destination id of the first Initial packet.
    ///
    /// **Default:** `8`
    pub dcid_len: usize,

    /// Keep receive credit fixed instead of extending it as data is read.
    ///
    /// **Default:** `false`
    pub dont_slide_credit_window: bool,

    /// Transport parameters announced to the server
    pub transport: TransportSettings,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4433,
            sni: String::new(),
            ipv6: false,
            initial_version: DEFAULT_VERSION,
            min_version: MIN_SUPPORTED_VERSION,
            max_version: MAX_SUPPORTED_VERSION,
            alpn: None,
            scid_len: 8,
            dcid_len: 8,
            dont_slide_credit_window: false,
            transport: TransportSettings::default(),
        }
    }
}

impl ConnectionSettings {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.host.is_empty() {
            errors.push("host must not be empty".to_string());
        }

        if self.port == 0 {
            errors.push("port must be > 0".to_string());
        }

        if self.min_version > self.max_version {
            errors.push(format!(
                "min_version 0x{:08x} is above max_version 0x{:08x}",
                self.min_version, self.max_version
            ));
        }

        if self.scid_len > MAX_CID_LENGTH {
            errors.push(format!("scid_len must be at most {}", MAX_CID_LENGTH));
        }

        if !(MIN_INITIAL_DCID_LENGTH..=MAX_CID_LENGTH).contains(&self.dcid_len) {
            errors.push(format!(
                "dcid_len must be between {} and {}",
                MIN_INITIAL_DCID_LENGTH, MAX_CID_LENGTH
            ));
        }

        if let Some(alpn) = &self.alpn {
            if alpn.is_empty() || alpn.len() > 255 {
                errors.push("alpn must be 1 to 255 bytes".to_string());
            }
        }

        if let Err(e) = self.transport.validate() {
            errors.extend(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Server name for TLS
    pub fn server_name(&self) -> &str {
        if self.sni.is_empty() {
            &self.host
        } else {
            &self.sni
        }
    }

    /// Resolve the server address, preferring the configured IP family
    pub fn server_addr(&self) -> Result<SocketAddr> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("resolving {}:{}", self.host, self.port))?
            .collect();
        addrs
            .iter()
            .find(|a| a.is_ipv6() == self.ipv6)
            .or_else(|| addrs.first())
            .copied()
            .with_context(|| format!("no address found for {}", self.host))
    }

    /// Engine configuration for a new client attempt with fresh random ids
    pub fn client_config(&self, mtu: usize) -> ConnectionConfig {
        let mut rng = rand::thread_rng();
        let scid = random_connection_id(&mut rng, self.scid_len);
        let dcid = random_connection_id(&mut rng, self.dcid_len);

        let mut config = ConnectionConfig::client(scid, dcid).with_version(self.initial_version);
        if let Some(alpn) = &self.alpn {
            config = config.with_alpn(alpn.clone());
        }
        config.versions = VersionRange::new(self.min_version, self.max_version);
        config.ipv6 = self.ipv6;
        config.transport_parameters = self.transport.to_parameters();
        config.dont_slide_credit_window = self.dont_slide_credit_window;
        config.mtu = mtu;
        config
    }
}

/// Random connection id of `len` bytes (clamped to the protocol maximum)
pub fn random_connection_id(rng: &mut impl Rng, len: usize) -> ConnectionId {
    let mut buf = [0u8; MAX_CID_LENGTH];
    let len = len.min(MAX_CID_LENGTH);
    rng.fill(&mut buf[..len]);
    ConnectionId::from_slice(&buf[..len]).unwrap_or_default()
}

/// Local transport parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_bidi_streams: u64,
    pub initial_max_uni_streams: u64,

    /// Seconds of inactivity before the connection is abandoned
    pub idle_timeout_secs: u64,

    pub ack_delay_exponent: u8,
    pub disable_migration: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::from(&TransportParameters::default())
    }
}

impl From<&TransportParameters> for TransportSettings {
    fn from(p: &TransportParameters) -> Self {
        Self {
            initial_max_data: p.initial_max_data,
            initial_max_stream_data_bidi_local: p.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: p.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: p.initial_max_stream_data_uni,
            initial_max_bidi_streams: p.initial_max_bidi_streams,
            initial_max_uni_streams: p.initial_max_uni_streams,
            idle_timeout_secs: p.idle_timeout,
            ack_delay_exponent: p.ack_delay_exponent,
            disable_migration: p.disable_migration,
        }
    }
}

impl TransportSettings {
    pub fn to_parameters(&self) -> TransportParameters {
        TransportParameters {
            initial_max_data: self.initial_max_data,
            initial_max_stream_data_bidi_local: self.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: self.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: self.initial_max_stream_data_uni,
            initial_max_bidi_streams: self.initial_max_bidi_streams,
            initial_max_uni_streams: self.initial_max_uni_streams,
            idle_timeout: self.idle_timeout_secs,
            ack_delay_exponent: self.ack_delay_exponent,
            disable_migration: self.disable_migration,
            ..TransportParameters::default()
        }
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        // Field widths of the draft parameter encoding
        match self.to_parameters().validate() {
            Ok(()) => Ok(()),
            Err(_) => Err(vec![
                "transport parameters out of range (data limits fit 32 bits, stream counts and idle timeout 16 bits, ack_delay_exponent <= 20)"
                    .to_string(),
            ]),
        }
    }
}
