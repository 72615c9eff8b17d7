//! Version Negotiation probe.
//!
//! Sends a padded Initial-shaped packet with a reserved version. A server
//! cannot accept a reserved version, so it answers with a Version
//! Negotiation packet listing what it supports; the payload is random and
//! never decrypted, so no TLS stack is needed. The offered list is then
//! run through the same negotiation the connection uses.

use crate::config::ConnectionSettings;
use crate::config::connection::random_connection_id;
use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use qprobe_quic::packet::{Header, LongHeader, PacketType, TruncatedPn, VersionNegotiationHeader};
use qprobe_quic::types::{min_initial_length, MAX_UDP_PAYLOAD_SIZE};
use qprobe_quic::version::{is_reserved_version, reserved_version, NegotiationState};
use qprobe_quic::{ConnectionId, VersionRange};
use rand::Rng;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Probes sent before giving up
pub const PROBE_ATTEMPTS: u32 = 3;

/// Time to wait for a reply to each probe
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of a completed probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Versions the server listed, in its order
    pub offered: Vec<u32>,
    /// Version our range would restart with, if any
    pub selected: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Probe {
    pub version: u32,
    pub scid: ConnectionId,
    pub dcid: ConnectionId,
    pub ipv6: bool,
    pub range: VersionRange,
    pub attempts: u32,
    pub reply_timeout: Duration,
}

impl Probe {
    /// Probe with fresh random ids and a random reserved version
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            version: reserved_version(rng.gen()),
            scid: random_connection_id(&mut rng, settings.scid_len),
            dcid: random_connection_id(&mut rng, settings.dcid_len),
            ipv6: settings.ipv6,
            range: VersionRange::new(settings.min_version, settings.max_version),
            attempts: PROBE_ATTEMPTS,
            reply_timeout: REPLY_TIMEOUT,
        }
    }

    /// The probe datagram, padded to the minimum Initial size
    pub fn datagram(&self) -> qprobe_quic::Result<Bytes> {
        let target = min_initial_length(self.ipv6);
        let mut header = Header::Long(LongHeader {
            packet_type: PacketType::Initial,
            version: self.version,
            dcid: self.dcid.clone(),
            scid: self.scid.clone(),
            token: Bytes::new(),
            length: target as u64,
            packet_number: TruncatedPn::new(0, 4)?,
        });
        // The Length field's own size depends on its value
        loop {
            let length = target.saturating_sub(header.pn_offset()) as u64;
            let before = header.pn_offset();
            header.set_length(length);
            if header.pn_offset() == before {
                break;
            }
        }

        let mut buf = BytesMut::with_capacity(target);
        header.encode(&mut buf)?;
        let mut payload = vec![0u8; target.saturating_sub(buf.len())];
        rand::thread_rng().fill(&mut payload[..]);
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decode a reply, ignoring anything not addressed to this probe
    pub fn parse_reply(&self, datagram: &[u8]) -> Option<VersionNegotiationHeader> {
        let vn = match VersionNegotiationHeader::decode(datagram) {
            Ok(vn) => vn,
            Err(e) => {
                debug!(error = %e, len = datagram.len(), "ignoring non-negotiation datagram");
                return None;
            }
        };
        if vn.dcid != self.scid || vn.scid != self.dcid {
            warn!(dcid = %vn.dcid, scid = %vn.scid, "version negotiation for other ids");
            return None;
        }
        Some(vn)
    }

    /// Run the configured negotiation over the offered versions
    pub fn evaluate(&self, offered: Vec<u32>) -> ProbeOutcome {
        let mut state = NegotiationState::default();
        let selected = state.on_version_negotiation(&self.range, &offered).ok();
        ProbeOutcome { offered, selected }
    }

    /// Send probes on a connected socket until a Version Negotiation
    /// packet arrives
    pub async fn run(&self, socket: &UdpSocket) -> Result<ProbeOutcome> {
        let datagram = self.datagram().context("encoding probe")?;
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD_SIZE];

        for attempt in 1..=self.attempts {
            socket.send(&datagram).await.context("sending probe")?;
            debug!(
                attempt,
                version = format_args!("0x{:08x}", self.version),
                len = datagram.len(),
                "probe sent"
            );

            let deadline = tokio::time::Instant::now() + self.reply_timeout;
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let len = match timeout(remaining, socket.recv(&mut buf)).await {
                    Ok(result) => result.context("receiving reply")?,
                    Err(_) => break,
                };
                if let Some(vn) = self.parse_reply(&buf[..len]) {
                    return Ok(self.report(vn.supported_versions));
                }
            }
        }

        bail!("no version negotiation after {} probes", self.attempts)
    }

    fn report(&self, offered: Vec<u32>) -> ProbeOutcome {
        let outcome = self.evaluate(offered);
        let listed: Vec<String> = outcome
            .offered
            .iter()
            .map(|v| {
                let grease = if is_reserved_version(*v) { " (reserved)" } else { "" };
                format!("0x{:08x}{}", v, grease)
            })
            .collect();
        match outcome.selected {
            Some(version) => info!(
                offered = ?listed,
                selected = format_args!("0x{:08x}", version),
                "server offers a supported version"
            ),
            None => error!(
                offered = ?listed,
                min = format_args!("0x{:08x}", self.range.min),
                max = format_args!("0x{:08x}", self.range.max),
                "no appropriate version offered"
            ),
        }
        outcome
    }
}
