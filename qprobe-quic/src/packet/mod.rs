//! # Packets
//!
//! A [`Packet`] is either a protected packet carrying frames (Initial,
//! 0-RTT, Handshake or 1-RTT) or one of the two unprotected long-header
//! packets (Retry and Version Negotiation). Every packet built or decoded
//! by this crate gets a [`PacketId`], a process-wide sequence number used to
//! correlate log lines and retransmissions with the packet they came from.

#![forbid(unsafe_code)]

pub mod header;
pub mod number;
pub mod protection;

pub use header::{
    Header, LongHeader, PacketLayout, PacketType, RetryHeader, ShortHeader,
    VersionNegotiationHeader,
};
pub use number::TruncatedPn;

use crate::crypto::EncryptionLevel;
use crate::error::{Error, Result};
use crate::frames::Frame;
use crate::types::{PacketNumber, PacketNumberSpace};
use bytes::Bytes;
use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_PACKET_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonic packet sequence id, assigned at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(u64);

impl PacketId {
    pub fn next() -> Self {
        PacketId(NEXT_PACKET_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for PacketId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A protected packet and its frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedPacket {
    pub id: PacketId,
    pub header: Header,
    /// Full packet number (the header only holds the truncated one)
    pub packet_number: PacketNumber,
    pub frames: Vec<Frame>,
}

impl FramedPacket {
    pub fn new(header: Header, packet_number: PacketNumber, frames: Vec<Frame>) -> Self {
        Self {
            id: PacketId::next(),
            header,
            packet_number,
            frames,
        }
    }

    pub fn level(&self) -> EncryptionLevel {
        match self.header.packet_type() {
            PacketType::Initial => EncryptionLevel::Initial,
            PacketType::ZeroRtt => EncryptionLevel::ZeroRtt,
            PacketType::Handshake => EncryptionLevel::Handshake,
            _ => EncryptionLevel::OneRtt,
        }
    }

    /// A packet needs an acknowledgement unless it only carries ACK,
    /// PADDING and close frames
    pub fn is_ack_eliciting(&self) -> bool {
        self.frames.iter().any(Frame::is_ack_eliciting)
    }

    /// Frames worth resending if the packet is lost
    pub fn retransmittable_frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter().filter(|f| f.is_retransmittable())
    }
}

/// Any packet this endpoint can send or receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Framed(FramedPacket),
    Retry {
        id: PacketId,
        header: RetryHeader,
    },
    VersionNegotiation {
        id: PacketId,
        header: VersionNegotiationHeader,
    },
}

impl Packet {
    pub fn retry(header: RetryHeader) -> Self {
        Packet::Retry {
            id: PacketId::next(),
            header,
        }
    }

    pub fn version_negotiation(header: VersionNegotiationHeader) -> Self {
        Packet::VersionNegotiation {
            id: PacketId::next(),
            header,
        }
    }

    pub fn id(&self) -> PacketId {
        match self {
            Packet::Framed(p) => p.id,
            Packet::Retry { id, .. } | Packet::VersionNegotiation { id, .. } => *id,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Framed(p) => p.header.packet_type(),
            Packet::Retry { .. } => PacketType::Retry,
            Packet::VersionNegotiation { .. } => PacketType::VersionNegotiation,
        }
    }

    pub fn space(&self) -> PacketNumberSpace {
        self.packet_type().space()
    }

    pub fn packet_number(&self) -> Option<PacketNumber> {
        match self {
            Packet::Framed(p) => Some(p.packet_number),
            _ => None,
        }
    }

    pub fn frames(&self) -> &[Frame] {
        match self {
            Packet::Framed(p) => &p.frames,
            _ => &[],
        }
    }

    pub fn is_ack_eliciting(&self) -> bool {
        match self {
            Packet::Framed(p) => p.is_ack_eliciting(),
            _ => false,
        }
    }
}

/// Iterator over the packets coalesced in one datagram
///
/// Long-header packets end where their Length field says; anything after a
/// short header, a Retry or a Version Negotiation packet belongs to it.
/// Iteration stops after the first layout error.
#[derive(Debug)]
pub struct CoalescedPackets {
    datagram: Bytes,
    offset: usize,
    local_cid_len: usize,
    failed: bool,
}

impl CoalescedPackets {
    pub fn new(datagram: Bytes, local_cid_len: usize) -> Self {
        Self {
            datagram,
            offset: 0,
            local_cid_len,
            failed: false,
        }
    }
}

impl Iterator for CoalescedPackets {
    type Item = Result<(PacketLayout, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.datagram.len() {
            return None;
        }
        let rest = &self.datagram[self.offset..];
        match PacketLayout::peek(rest, self.local_cid_len) {
            Ok(layout) if layout.len == 0 => {
                self.failed = true;
                Some(Err(Error::MalformedPacket("empty packet")))
            }
            Ok(layout) => {
                let packet = self.datagram.slice(self.offset..self.offset + layout.len);
                self.offset += layout.len;
                Some(Ok((layout, packet)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
