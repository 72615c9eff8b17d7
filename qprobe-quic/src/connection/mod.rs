//! # Connection State
//!
//! The aggregate of one connection attempt: identity, per-space packet
//! number state, per-level keys, the stream and crypto stream registries and
//! flow control. Pure state: datagrams and time go in, datagrams and events
//! come out.
//!
//! ## Sending
//!
//! ```text
//! frames -> payload (+ padding) -> patch Length -> header
//!        -> AEAD seal (header as AAD) -> header protection -> datagram
//! ```
//!
//! Client Initial packets are padded so the datagram reaches the minimum
//! Initial size (1252 bytes over IPv4, 1232 over IPv6). Every packet is
//! padded so the header protection sample fits.
//!
//! ## Receiving
//!
//! A datagram is split into its coalesced packets. Each protected packet is
//! unmasked, its header re-parsed with the now known packet number length,
//! and its payload opened. A packet whose read keys are not installed yet is
//! handed back for buffering instead of being dropped.

#![forbid(unsafe_code)]

pub mod config;
pub mod lifecycle;
pub mod space;

pub use config::ConnectionConfig;
pub use lifecycle::{ConnectionState, Lifecycle};
pub use space::SpaceState;

use crate::crypto::{
    CryptoProvider, CryptoState, CryptoStates, DirectionalEncryptionLevel, EncryptionLevel,
    KeyDirection, SAMPLE_LEN,
};
use crate::error::{Error, ProtocolViolation, Result};
use crate::flow_control::{FlowController, Reservation};
use crate::frames::{
    decode_frames, encode_frames, AckFrame, ApplicationCloseFrame, ConnectionCloseFrame, Frame,
};
use crate::packet::protection::{self, SAMPLE_OFFSET_FROM_PN};
use crate::packet::{
    CoalescedPackets, FramedPacket, Header, LongHeader, Packet, PacketLayout, PacketType,
    RetryHeader, ShortHeader, VersionNegotiationHeader,
};
use crate::stream::{CryptoStreams, Streams};
use crate::transport::{TransportParameters, TransportParametersExtension};
use crate::types::{min_initial_length, ConnectionId, PacketNumber, PacketNumberSpace, Side, StreamId};
use crate::version::NegotiationState;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Bytes handed over by one received packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Newly contiguous handshake bytes per level
    pub crypto: Vec<(EncryptionLevel, Bytes)>,
    /// Newly contiguous stream bytes
    pub streams: Vec<StreamDelivery>,
    pub violations: Vec<ProtocolViolation>,
    /// The peer sent CONNECTION_CLOSE or APPLICATION_CLOSE
    pub peer_closed: bool,
}

/// Stream bytes delivered in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDelivery {
    pub stream_id: StreamId,
    pub data: Bytes,
    /// The stream's read side is complete
    pub finished: bool,
}

/// A packet opened and applied to the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub packet: Packet,
    pub delivery: Delivery,
}

/// Outcome for one packet of a datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Packet(DecodedPacket),
    /// Read keys for `level` are not installed; retry once they are
    Undecryptable { level: EncryptionLevel, data: Bytes },
    Dropped(Error),
}

/// A packet ready for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub packet: FramedPacket,
    pub datagram: Bytes,
}

/// One connection attempt
pub struct Connection {
    config: ConnectionConfig,
    provider: Arc<dyn CryptoProvider>,
    original_dcid: ConnectionId,
    initial_version: u32,
    crypto: CryptoStates,
    spaces: [SpaceState; 3],
    streams: Streams,
    crypto_streams: CryptoStreams,
    flow: FlowController,
    lifecycle: Lifecycle,
    negotiation: NegotiationState,
    retry_received: bool,
    peer_parameters: Option<TransportParameters>,
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.config.side)
            .field("version", &format_args!("0x{:08x}", self.config.version))
            .field("state", &self.lifecycle.state())
            .field("streams", &self.streams.len())
            .finish()
    }
}

impl Connection {
    /// Create the connection and install its Initial keys
    pub fn new(config: ConnectionConfig, provider: Arc<dyn CryptoProvider>) -> Result<Self> {
        let side = config.side;
        let mut conn = Self {
            original_dcid: config.dcid.clone(),
            initial_version: config.version,
            flow: FlowController::new(side, !config.dont_slide_credit_window),
            config,
            provider,
            crypto: CryptoStates::default(),
            spaces: Default::default(),
            streams: Streams::new(side),
            crypto_streams: CryptoStreams::default(),
            lifecycle: Lifecycle::default(),
            negotiation: NegotiationState::default(),
            retry_received: false,
            peer_parameters: None,
        };
        let (version, alpn) = (conn.config.version, conn.config.alpn.clone());
        conn.transition_to(version, alpn)?;
        Ok(conn)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn side(&self) -> Side {
        self.config.side
    }

    pub fn version(&self) -> u32 {
        self.config.version
    }

    pub fn alpn(&self) -> &str {
        &self.config.alpn
    }

    /// Destination id of the very first Initial packet
    pub fn original_dcid(&self) -> &ConnectionId {
        &self.original_dcid
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn negotiation(&self) -> NegotiationState {
        self.negotiation
    }

    pub fn crypto_states(&self) -> &CryptoStates {
        &self.crypto
    }

    pub fn space(&self, space: PacketNumberSpace) -> Option<&SpaceState> {
        space.index().map(|i| &self.spaces[i])
    }

    pub fn space_mut(&mut self, space: PacketNumberSpace) -> Option<&mut SpaceState> {
        space.index().map(move |i| &mut self.spaces[i])
    }

    pub fn streams(&self) -> &Streams {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut Streams {
        &mut self.streams
    }

    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    pub fn flow_mut(&mut self) -> &mut FlowController {
        &mut self.flow
    }

    pub fn peer_transport_parameters(&self) -> Option<&TransportParameters> {
        self.peer_parameters.as_ref()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Reset every per-attempt state for `version` and `alpn`
    ///
    /// Packet number counters restart at zero, only Initial keys (derived
    /// from the current destination id) are installed and the stream
    /// registries are emptied. Returns the level announcements to publish.
    pub fn transition_to(
        &mut self,
        version: u32,
        alpn: impl Into<String>,
    ) -> Result<Vec<DirectionalEncryptionLevel>> {
        // Initial keys come from the id the client picked for the server
        let key_id = match self.config.side {
            Side::Client => &self.config.dcid,
            Side::Server => &self.config.scid,
        };
        let initial = CryptoState::initial(self.provider.as_ref(), version, key_id, self.config.side)?;
        self.lifecycle.transition(ConnectionState::Negotiating(version))?;
        self.config.version = version;
        self.config.alpn = alpn.into();
        self.spaces = Default::default();
        self.crypto.clear();
        *self.crypto.get_mut(EncryptionLevel::Initial)? = initial;
        self.streams.clear();
        self.crypto_streams.clear();
        self.flow = FlowController::new(self.config.side, !self.config.dont_slide_credit_window);
        self.peer_parameters = None;
        debug!(
            version = format_args!("0x{version:08x}"),
            alpn = %self.config.alpn,
            dcid = ?self.config.dcid,
            "transitioned connection"
        );

        Ok([KeyDirection::Read, KeyDirection::Write]
            .into_iter()
            .map(|direction| DirectionalEncryptionLevel {
                level: EncryptionLevel::Initial,
                direction,
                available: true,
            })
            .collect())
    }

    /// Install keys derived from a TLS traffic secret
    pub fn install_keys(
        &mut self,
        level: EncryptionLevel,
        direction: KeyDirection,
        secret: &[u8],
    ) -> Result<DirectionalEncryptionLevel> {
        let provider = self.provider.clone();
        self.crypto
            .get_mut(level)?
            .install(provider.as_ref(), direction, secret)?;
        if level == EncryptionLevel::Handshake
            && matches!(self.lifecycle.state(), ConnectionState::Negotiating(_))
        {
            self.lifecycle.transition(ConnectionState::Handshaking)?;
        }
        debug!(?level, ?direction, "keys installed");
        Ok(DirectionalEncryptionLevel {
            level,
            direction,
            available: true,
        })
    }

    /// Discard both directions of a level
    pub fn drop_keys(&mut self, level: EncryptionLevel) -> Result<Vec<DirectionalEncryptionLevel>> {
        *self.crypto.get_mut(level)? = CryptoState::default();
        debug!(?level, "keys dropped");
        Ok([KeyDirection::Read, KeyDirection::Write]
            .into_iter()
            .map(|direction| DirectionalEncryptionLevel {
                level,
                direction,
                available: false,
            })
            .collect())
    }

    /// TLS reported the handshake complete
    pub fn on_handshake_complete(&mut self) -> Result<()> {
        self.lifecycle.transition(ConnectionState::Established)?;
        Ok(())
    }

    /// Enter `Closing` and build the close frame to send
    pub fn close(&mut self, application: bool, error_code: u16, reason: &str) -> Result<Frame> {
        self.lifecycle.transition(ConnectionState::Closing)?;
        let reason = Bytes::copy_from_slice(reason.as_bytes());
        Ok(if application {
            Frame::ApplicationClose(ApplicationCloseFrame { error_code, reason })
        } else {
            Frame::ConnectionClose(ConnectionCloseFrame {
                error_code,
                frame_type: 0,
                reason,
            })
        })
    }

    /// The connection is gone; nothing more is accepted
    pub fn on_closed(&mut self) {
        if !self.lifecycle.state().is_closed() {
            // Every open state may move to Closed
            let _ = self.lifecycle.transition(ConnectionState::Closed);
        }
    }

    // ------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------

    /// Restart with the first offered version in the supported range
    ///
    /// An empty intersection fails the attempt for good and leaves the
    /// configured version untouched.
    pub fn process_version_negotiation(&mut self, vn: &VersionNegotiationHeader) -> Result<u32> {
        let first = self.negotiation == NegotiationState::NotNegotiated;
        let version = match self
            .negotiation
            .on_version_negotiation(&self.config.versions, &vn.supported_versions)
        {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(
                    offered = ?vn.supported_versions,
                    min = format_args!("0x{:08x}", self.config.versions.min),
                    max = format_args!("0x{:08x}", self.config.versions.max),
                    "no appropriate version found"
                );
                return Err(e);
            }
        };
        if !first {
            debug!("ignoring version negotiation after agreement");
            return Ok(version);
        }
        let mut config = self.config.clone();
        config.set_version(version);
        let alpn = config.alpn;
        self.transition_to(version, alpn)?;
        Ok(version)
    }

    /// Restart towards the id chosen by the server, echoing its token
    ///
    /// Returns false when the Retry is ignored (a second one).
    pub fn process_retry(&mut self, retry: &RetryHeader) -> Result<bool> {
        if self.retry_received {
            debug!("ignoring second retry");
            return Ok(false);
        }
        if retry.original_dcid != self.config.dcid {
            return Err(Error::MalformedPacket("retry original destination id mismatch"));
        }
        self.retry_received = true;
        self.config.dcid = retry.scid.clone();
        self.config.token = retry.token.clone();
        let (version, alpn) = (self.config.version, self.config.alpn.clone());
        self.transition_to(version, alpn)?;
        Ok(true)
    }

    /// Transport parameter extension to hand to TLS
    pub fn local_transport_parameters(&self) -> Result<Bytes> {
        let parameters = self.config.transport_parameters.clone();
        let ext = match self.config.side {
            Side::Client => TransportParametersExtension::ClientHello {
                initial_version: self.initial_version,
                parameters,
            },
            Side::Server => TransportParametersExtension::EncryptedExtensions {
                negotiated_version: self.config.version,
                supported_versions: vec![self.config.versions.min, self.config.versions.max],
                parameters,
            },
        };
        ext.encode()
    }

    /// Peer parameters received through TLS; flow control becomes ready
    pub fn on_peer_transport_parameters(&mut self, data: &[u8]) -> Result<&TransportParameters> {
        let from_client = self.config.side == Side::Server;
        let ext = TransportParametersExtension::decode(data, from_client)?;
        let parameters = ext.parameters().clone();
        parameters.validate()?;
        self.flow
            .on_transport_parameters(&self.config.transport_parameters, &parameters);
        Ok(self.peer_parameters.insert(parameters))
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn header_for(&self, packet_type: PacketType, pn: PacketNumber, space: &SpaceState) -> Header {
        let packet_number = space.truncate(pn);
        match packet_type {
            PacketType::OneRtt => Header::Short(ShortHeader {
                spin: false,
                key_phase: false,
                dcid: self.config.dcid.clone(),
                packet_number,
            }),
            _ => Header::Long(LongHeader {
                packet_type,
                version: self.config.version,
                dcid: self.config.dcid.clone(),
                scid: self.config.scid.clone(),
                token: if packet_type == PacketType::Initial {
                    self.config.token.clone()
                } else {
                    Bytes::new()
                },
                length: 0,
                packet_number,
            }),
        }
    }

    /// Assign a packet number, then encode, seal and protect `frames`
    pub fn encode_packet(&mut self, level: EncryptionLevel, mut frames: Vec<Frame>) -> Result<EncodedPacket> {
        if self.lifecycle.state().is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if frames.is_empty() {
            return Err(Error::MalformedPacket("no frames to send"));
        }
        let packet_type = PacketType::for_level(level)
            .ok_or(Error::KeysUnavailable(level))?;
        let state = self.crypto.get(level)?;
        let (Some(aead), Some(hp)) = (state.write.clone(), state.write_hp.clone()) else {
            return Err(Error::KeysUnavailable(level));
        };
        let overhead = aead.overhead();
        let space_idx = level.space().index().ok_or(Error::KeysUnavailable(level))?;

        let pn = self.spaces[space_idx].take_packet_number();
        let mut header = self.header_for(packet_type, pn, &self.spaces[space_idx]);
        let pn_len = header.packet_number().len();

        let mut payload = encode_frames(&frames)?;
        let min_payload = (SAMPLE_OFFSET_FROM_PN + SAMPLE_LEN).saturating_sub(pn_len + overhead);
        let mut padding = min_payload.saturating_sub(payload.len());
        header.set_length((pn_len + payload.len() + padding + overhead) as u64);

        if packet_type == PacketType::Initial && self.config.side == Side::Client {
            let target = min_initial_length(self.config.ipv6);
            let total = header.header_length() + payload.len() + padding + overhead;
            padding += target.saturating_sub(total);
            header.set_length((pn_len + payload.len() + padding + overhead) as u64);
        }
        if padding > 0 {
            payload.put_bytes(0, padding);
            frames.push(Frame::Padding(padding));
        }

        let mut datagram = BytesMut::with_capacity(header.header_length() + payload.len() + overhead);
        header.encode(&mut datagram)?;
        let sealed = aead.seal(pn, &datagram, &payload)?;
        datagram.extend_from_slice(&sealed);
        protection::apply(&mut datagram, header.pn_offset(), pn_len, hp.as_ref())?;

        trace!(
            ?level,
            pn,
            len = datagram.len(),
            frames = frames.len(),
            "packet encoded"
        );
        Ok(EncodedPacket {
            packet: FramedPacket::new(header, pn, frames),
            datagram: datagram.freeze(),
        })
    }

    /// Frame bytes that fit in a packet of `mtu` bytes at `level`
    pub fn packet_budget(&self, level: EncryptionLevel, mtu: usize) -> Result<usize> {
        let packet_type = PacketType::for_level(level).ok_or(Error::KeysUnavailable(level))?;
        let state = self.crypto.get(level)?;
        if !state.can_write() {
            return Err(Error::KeysUnavailable(level));
        }
        let space = self.space(level.space()).ok_or(Error::KeysUnavailable(level))?;
        let mut header = self.header_for(packet_type, space.next_packet_number(), space);
        header.set_length(mtu as u64);
        Ok(mtu.saturating_sub(header.header_length() + state.write_overhead()))
    }

    /// ACK frame for everything received in `space`
    pub fn ack_frame(&self, space: PacketNumberSpace, now: Instant) -> Option<AckFrame> {
        self.space(space)?
            .ack_frame(now, self.config.transport_parameters.ack_delay_exponent)
    }

    /// Queue a received packet for acknowledgement; true for a duplicate
    pub fn record_received(&mut self, space: PacketNumberSpace, pn: PacketNumber, at: Instant) -> bool {
        self.space_mut(space)
            .map(|s| s.record_received(pn, at))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Decode every packet of a datagram
    pub fn decode_datagram(&mut self, datagram: Bytes) -> Vec<Decoded> {
        let local_cid_len = self.config.scid.len();
        let mut out = Vec::new();
        for item in CoalescedPackets::new(datagram, local_cid_len) {
            let (layout, data) = match item {
                Ok(v) => v,
                Err(e) => {
                    out.push(Decoded::Dropped(e));
                    break;
                }
            };
            out.push(self.decode_one(&layout, data));
        }
        out
    }

    /// Retry a packet buffered for missing keys
    pub fn decode_buffered(&mut self, data: Bytes) -> Decoded {
        match PacketLayout::peek(&data, self.config.scid.len()) {
            Ok(layout) => self.decode_one(&layout, data),
            Err(e) => Decoded::Dropped(e),
        }
    }

    fn decode_one(&mut self, layout: &PacketLayout, data: Bytes) -> Decoded {
        match self.decode_packet(layout, &data) {
            Ok(decoded) => Decoded::Packet(decoded),
            Err(Error::KeysUnavailable(level)) => {
                debug!(?level, len = data.len(), "keys unavailable, buffering packet");
                Decoded::Undecryptable { level, data }
            }
            Err(e) => {
                warn!(error = %e, packet_type = ?layout.packet_type, "dropping packet");
                Decoded::Dropped(e)
            }
        }
    }

    /// Two-pass decode of one packet, then apply its frames
    pub fn decode_packet(&mut self, layout: &PacketLayout, data: &[u8]) -> Result<DecodedPacket> {
        let packet = match layout.packet_type {
            PacketType::VersionNegotiation => {
                Packet::version_negotiation(VersionNegotiationHeader::decode(data)?)
            }
            PacketType::Retry => Packet::retry(RetryHeader::decode(data)?),
            packet_type => {
                let level = packet_type
                    .encryption_level()
                    .ok_or(Error::MalformedPacket("packet type without keys"))?;
                let pn_offset = layout
                    .pn_offset
                    .ok_or(Error::MalformedPacket("missing packet number"))?;
                let state = self.crypto.get(level)?;
                let (Some(aead), Some(hp)) = (state.read.clone(), state.read_hp.clone()) else {
                    return Err(Error::KeysUnavailable(level));
                };

                let mut buf = BytesMut::from(data);
                protection::remove(&mut buf, pn_offset, hp.as_ref())?;
                let (header, header_len) = Header::decode(&buf, self.config.scid.len())?;
                let space_idx = level
                    .space()
                    .index()
                    .ok_or(Error::MalformedPacket("packet without space"))?;
                let pn = self.spaces[space_idx].join(header.packet_number());
                let plaintext = aead.open(pn, &buf[..header_len], &buf[header_len..])?;
                self.spaces[space_idx].on_packet_opened(pn);

                let frames = decode_frames(Bytes::from(plaintext))?;
                let delivery = self.apply_frames(level, &frames);
                let packet = Packet::Framed(FramedPacket::new(header, pn, frames));
                trace!(?level, pn, id = %packet.id(), "packet decoded");
                return Ok(DecodedPacket { packet, delivery });
            }
        };
        Ok(DecodedPacket {
            packet,
            delivery: Delivery::default(),
        })
    }

    /// Hand stream and crypto data to their reassembly buffers and apply
    /// flow control frames
    fn apply_frames(&mut self, level: EncryptionLevel, frames: &[Frame]) -> Delivery {
        let mut delivery = Delivery::default();
        let side = self.config.side;
        for frame in frames {
            match frame {
                Frame::Crypto(f) => {
                    if let Some(stream) = self.crypto_streams.get_mut(level.space()) {
                        let insertion = stream.recv.insert(f.offset, &f.data, false);
                        if let Some(limit) = insertion.window_exceeded {
                            let violation = ProtocolViolation::CryptoBufferExceeded {
                                limit,
                                offset: f.end(),
                            };
                            warn!(?level, ?violation, "crypto frame rejected");
                            delivery.violations.push(violation);
                            continue;
                        }
                        if let Some(data) = insertion.delivered {
                            delivery.crypto.push((level, data));
                        }
                    }
                }
                Frame::Stream(f) => {
                    let stream = self.streams.get_or_create(f.stream_id);
                    if let Err(violation) = self.flow.on_stream_frame(stream, f) {
                        warn!(?violation, "stream frame rejected");
                        delivery.violations.push(violation);
                        continue;
                    }
                    let read = stream.add_to_read(f, side);
                    if read.duplicate {
                        trace!(stream = f.stream_id.value(), "duplicate stream data");
                    }
                    if let Some(violation) = read.violation {
                        warn!(?violation, "stream anomaly");
                        delivery.violations.push(violation);
                    }
                    if read.delivered.is_some() || read.finished {
                        delivery.streams.push(StreamDelivery {
                            stream_id: f.stream_id,
                            data: read.delivered.unwrap_or_default(),
                            finished: read.finished,
                        });
                    }
                }
                Frame::MaxData(max) => self.flow.on_max_data(*max),
                Frame::MaxStreamData(f) => {
                    let stream = self.streams.get_or_create(f.stream_id);
                    self.flow.on_max_stream_data(stream, f.maximum_stream_data);
                }
                Frame::MaxStreamId(id) => self.flow.on_max_stream_id(*id),
                Frame::ResetStream(f) if !f.stream_id.can_receive(side) => {
                    delivery.violations.push(ProtocolViolation::StreamDirection {
                        stream_id: f.stream_id.value(),
                        frame: "RESET_STREAM",
                    });
                }
                Frame::StopSending(f) if !f.stream_id.can_send(side) => {
                    delivery.violations.push(ProtocolViolation::StreamDirection {
                        stream_id: f.stream_id.value(),
                        frame: "STOP_SENDING",
                    });
                }
                Frame::Ack(ack) => {
                    if let Some(space) = self.space_mut(level.space()) {
                        space.on_ack_received(ack.largest_acknowledged);
                    }
                }
                Frame::ConnectionClose(_) | Frame::ApplicationClose(_) => {
                    delivery.peer_closed = true;
                    if !self.lifecycle.state().is_closing() {
                        let _ = self.lifecycle.transition(ConnectionState::Closing);
                    }
                }
                _ => {}
            }
        }
        delivery
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// Lowest unused locally initiated stream id
    pub fn next_stream_id(&self, bidirectional: bool) -> StreamId {
        self.streams.next_available_stream_id(bidirectional)
    }

    /// Reserve send credit for `credit` bytes on `stream_id`
    pub fn reserve_credit(&mut self, stream_id: StreamId, credit: u64, partial: bool) -> Reservation {
        let stream = self.streams.get_or_create(stream_id);
        if partial {
            self.flow.reserve_at_most(stream, credit)
        } else {
            self.flow.reserve_credit(stream, credit)
        }
    }

    /// Offset for `len` new outbound bytes on a stream
    pub fn stream_write(&mut self, stream_id: StreamId, len: usize, close: bool) -> Result<u64> {
        let side = self.config.side;
        self.streams.get_or_create(stream_id).on_write(len, close, side)
    }

    pub fn close_stream(&mut self, stream_id: StreamId) -> Result<Frame> {
        let side = self.config.side;
        self.streams.get_or_create(stream_id).close(side)
    }

    pub fn reset_stream(&mut self, stream_id: StreamId, error_code: u16) -> Result<Frame> {
        let side = self.config.side;
        self.streams.get_or_create(stream_id).reset(error_code, side)
    }

    pub fn stop_sending(&mut self, stream_id: StreamId, error_code: u16) -> Result<Frame> {
        let side = self.config.side;
        self.streams
            .get_or_create(stream_id)
            .stop_sending(error_code, side)
    }

    /// Offset for `len` outbound handshake bytes at `level`
    pub fn crypto_write(&mut self, level: EncryptionLevel, len: usize) -> Result<u64> {
        self.crypto_streams
            .get_mut(level.space())
            .map(|s| s.reserve_write(len))
            .ok_or(Error::KeysUnavailable(level))
    }

    /// Pending window updates for a packet at `level`
    pub fn flow_control_frames(&mut self, level: EncryptionLevel, available: usize) -> Vec<Frame> {
        self.flow.pending_frames(level, available)
    }
}

#[cfg(test)]
mod tests;
