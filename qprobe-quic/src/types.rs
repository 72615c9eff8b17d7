//! # Core QUIC Types
//!
//! Fundamental values shared by every engine module: variable-length
//! integers, connection ids, packet-number spaces, stream ids and the
//! bounds-checked cursor used by all decoders.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

// ============================================================================
// Variable-Length Integer Encoding
// ============================================================================

/// Variable-Length Integer
///
/// The first two bits carry the length: 00=1 byte, 01=2 bytes,
/// 10=4 bytes, 11=8 bytes. Maximum value: 2^62 - 1
pub type VarInt = u64;

/// Maximum value for VarInt (2^62 - 1)
pub const VARINT_MAX: u64 = (1u64 << 62) - 1;

/// VarInt encoding and decoding utilities
pub struct VarIntCodec;

impl VarIntCodec {
    /// Decode a VarInt from a byte slice, returning (value, bytes_consumed)
    ///
    /// Returns None if the buffer ends before the encoded length
    pub fn decode(buf: &[u8]) -> Option<(VarInt, usize)> {
        let first = *buf.first()?;
        let len = 1usize << (first >> 6);
        if buf.len() < len {
            return None;
        }

        let mut value = (first & 0x3f) as u64;
        for byte in &buf[1..len] {
            value = (value << 8) | *byte as u64;
        }
        Some((value, len))
    }

    /// Encode a VarInt into a buffer, returning bytes written
    ///
    /// Returns None if value exceeds VARINT_MAX or buffer is too small
    pub fn encode(value: VarInt, buf: &mut [u8]) -> Option<usize> {
        if value > VARINT_MAX {
            return None;
        }

        let len = Self::size(value);
        if buf.len() < len {
            return None;
        }

        let tag: u8 = match len {
            1 => 0x00,
            2 => 0x40,
            4 => 0x80,
            _ => 0xc0,
        };
        for (i, slot) in buf[..len].iter_mut().enumerate() {
            *slot = (value >> (8 * (len - 1 - i))) as u8;
        }
        buf[0] |= tag;
        Some(len)
    }

    /// Append the minimal encoding of `value` to a growable buffer
    pub fn put(value: VarInt, buf: &mut BytesMut) -> Result<()> {
        let mut scratch = [0u8; 8];
        let n = Self::encode(value, &mut scratch).ok_or(Error::VarIntOutOfRange(value))?;
        buf.put_slice(&scratch[..n]);
        Ok(())
    }

    /// Calculate the encoded size for a given value
    pub fn size(value: VarInt) -> usize {
        if value < 0x40 {
            1
        } else if value < 0x4000 {
            2
        } else if value < 0x4000_0000 {
            4
        } else {
            8
        }
    }
}

// ============================================================================
// Wire Cursor
// ============================================================================

/// Bounds-checked reader over a borrowed buffer
///
/// Every read fails with [`Error::UnexpectedEnd`] instead of panicking,
/// so decoders can use `?` throughout.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current read position
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread part of the buffer
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn peek_u8(&self) -> Result<u8> {
        self.buf.get(self.pos).copied().ok_or(Error::UnexpectedEnd)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = self.peek_u8()?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_varint(&mut self) -> Result<VarInt> {
        let (value, len) = VarIntCodec::decode(self.rest()).ok_or(Error::UnexpectedEnd)?;
        self.pos += len;
        Ok(value)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::UnexpectedEnd);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Read a fixed-size array
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Read a varint length followed by that many bytes
    pub fn read_varint_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint()?;
        let len = usize::try_from(len).map_err(|_| Error::UnexpectedEnd)?;
        self.read_bytes(len)
    }

    /// Consume everything that is left
    pub fn read_rest(&mut self) -> &'a [u8] {
        let out = self.rest();
        self.pos = self.buf.len();
        out
    }
}

// ============================================================================
// Connection ID
// ============================================================================

/// Maximum length of a Connection ID
pub const MAX_CID_LENGTH: usize = 20;

/// Connection ID - opaque identifier chosen by each endpoint
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    bytes: Bytes,
}

impl ConnectionId {
    /// Create a new ConnectionId from bytes
    ///
    /// Returns None if length exceeds MAX_CID_LENGTH
    pub fn new(bytes: Bytes) -> Option<Self> {
        if bytes.len() > MAX_CID_LENGTH {
            return None;
        }
        Some(Self { bytes })
    }

    /// Create from a borrowed slice (copies data)
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        Self::new(Bytes::copy_from_slice(slice))
    }

    /// Access the underlying bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Create an empty (zero-length) connection ID
    pub fn empty() -> Self {
        Self { bytes: Bytes::new() }
    }
}

impl core::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in &self.bytes[..] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

// ============================================================================
// Packet Number Spaces
// ============================================================================

/// Full (untruncated) packet number
pub type PacketNumber = u64;

/// Packet Number Space
///
/// Each space has its own packet-number sequence. `NoSpace` covers the
/// packets that carry no packet number (Version Negotiation, Retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketNumberSpace {
    /// Initial packets
    Initial = 0,
    /// Handshake packets
    Handshake = 1,
    /// 0-RTT and 1-RTT packets
    ApplicationData = 2,
    /// Version Negotiation and Retry
    NoSpace = 3,
}

impl PacketNumberSpace {
    /// The three spaces that carry packet numbers
    pub const ALL: [PacketNumberSpace; 3] = [
        PacketNumberSpace::Initial,
        PacketNumberSpace::Handshake,
        PacketNumberSpace::ApplicationData,
    ];

    /// Index into per-space arrays, None for NoSpace
    pub fn index(self) -> Option<usize> {
        match self {
            PacketNumberSpace::NoSpace => None,
            other => Some(other as usize),
        }
    }
}

// ============================================================================
// Stream ID
// ============================================================================

/// Stream ID
///
/// The two least significant bits encode stream type and initiator:
/// - Bit 0: Initiator (0=client, 1=server)
/// - Bit 1: Direction (0=bidirectional, 1=unidirectional)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_bidirectional(&self) -> bool {
        (self.0 & 0x02) == 0
    }

    pub fn is_unidirectional(&self) -> bool {
        (self.0 & 0x02) != 0
    }

    pub fn is_client_initiated(&self) -> bool {
        (self.0 & 0x01) == 0
    }

    /// Whether `side` opened this stream
    pub fn is_local(&self, side: Side) -> bool {
        self.is_client_initiated() == side.is_client()
    }

    /// Whether `side` may send on this stream
    pub fn can_send(&self, side: Side) -> bool {
        self.is_bidirectional() || self.is_local(side)
    }

    /// Whether `side` may receive on this stream
    pub fn can_receive(&self, side: Side) -> bool {
        self.is_bidirectional() || !self.is_local(side)
    }

    /// Ordinal of this stream among streams of the same type (id / 4)
    pub fn sequence(&self) -> u64 {
        self.0 >> 2
    }
}

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stream Type - Encodes directionality and initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    /// Client-initiated bidirectional stream
    ClientBidirectional = 0x00,
    /// Server-initiated bidirectional stream
    ServerBidirectional = 0x01,
    /// Client-initiated unidirectional stream
    ClientUnidirectional = 0x02,
    /// Server-initiated unidirectional stream
    ServerUnidirectional = 0x03,
}

impl StreamType {
    /// Extract stream type from stream ID
    pub fn from_stream_id(id: StreamId) -> Self {
        match id.0 & 0x03 {
            0x00 => StreamType::ClientBidirectional,
            0x01 => StreamType::ServerBidirectional,
            0x02 => StreamType::ClientUnidirectional,
            _ => StreamType::ServerUnidirectional,
        }
    }

    /// Build the stream type for an initiator and direction
    pub fn new(initiator: Side, bidirectional: bool) -> Self {
        match (initiator, bidirectional) {
            (Side::Client, true) => StreamType::ClientBidirectional,
            (Side::Server, true) => StreamType::ServerBidirectional,
            (Side::Client, false) => StreamType::ClientUnidirectional,
            (Side::Server, false) => StreamType::ServerUnidirectional,
        }
    }

    /// The n-th stream id of this type (type + 4n)
    pub fn nth(self, n: u64) -> StreamId {
        StreamId((n << 2) | self as u64)
    }
}

// ============================================================================
// Side (Client vs Server)
// ============================================================================

/// Connection endpoint side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        matches!(self, Side::Client)
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

// ============================================================================
// Datagram Size Constants
// ============================================================================

/// Minimum datagram length carrying the first Initial packet over IPv4
pub const MIN_INITIAL_LENGTH_V4: usize = 1252;

/// Minimum datagram length carrying the first Initial packet over IPv6
pub const MIN_INITIAL_LENGTH_V6: usize = 1232;

/// Largest UDP payload the engine consumes or produces
pub const MAX_UDP_PAYLOAD_SIZE: usize = 65507;

/// Default outgoing packet size
pub const DEFAULT_MTU: usize = 1200;

/// Minimum Initial datagram length for the address family
pub fn min_initial_length(ipv6: bool) -> usize {
    if ipv6 {
        MIN_INITIAL_LENGTH_V6
    } else {
        MIN_INITIAL_LENGTH_V4
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
