//! # Packet Headers
//!
//! Owned header types for the two header forms plus the two long-header
//! packets that carry no packet number (Retry and Version Negotiation).
//!
//! ## Long header
//!
//! ```text
//! byte 0   1 1 T T 0 0 P P   (T = packet type, P = packet number length - 1)
//! version  u32
//! dcid     u8 length + bytes
//! scid     u8 length + bytes
//! token    varint length + bytes          (Initial only)
//! length   varint: pn + payload + AEAD tag (not in Retry)
//! pn       1, 2 or 4 bytes
//! ```
//!
//! ## Short header
//!
//! ```text
//! byte 0   0 1 S 0 0 K P P   (S = spin, K = key phase)
//! dcid     local connection id length, no length prefix
//! pn       1, 2 or 4 bytes
//! ```
//!
//! Decoding is split in two: [`PacketLayout::peek`] reads only what header
//! protection does not cover, so the packet-number offset is known before
//! the mask is removed; [`Header::decode`] then parses the unmasked bytes.

#![forbid(unsafe_code)]

use super::number::TruncatedPn;
use crate::crypto::EncryptionLevel;
use crate::error::{Error, Result};
use crate::types::{ConnectionId, Cursor, PacketNumberSpace, VarIntCodec, MAX_CID_LENGTH};
use crate::version::VERSION_NEGOTIATION;
use bytes::{BufMut, Bytes, BytesMut};

// ============================================================================
// First Byte Layout
// ============================================================================

/// Header Form Bit: 1 = long header
pub const HEADER_FORM_BIT: u8 = 0x80;

/// Fixed Bit, set in every packet this endpoint sends
pub const FIXED_BIT: u8 = 0x40;

/// Long Packet Type Mask (bits 4-5)
pub const LONG_PACKET_TYPE_MASK: u8 = 0x30;

/// Spin Bit (short header)
pub const SPIN_BIT: u8 = 0x20;

/// Key Phase Bit (short header)
pub const KEY_PHASE_BIT: u8 = 0x04;

/// Packet Number Length Mask (bottom 2 bits)
pub const PACKET_NUMBER_LENGTH_MASK: u8 = 0x03;

/// First-byte bits covered by header protection in a long header
pub const LONG_PROTECTED_BITS: u8 = 0x0f;

/// First-byte bits covered by header protection in a short header
pub const SHORT_PROTECTED_BITS: u8 = 0x1f;

// ============================================================================
// Packet Type
// ============================================================================

/// Packet Type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Long header type 0x0
    Initial,
    /// Long header type 0x1
    ZeroRtt,
    /// Long header type 0x2
    Handshake,
    /// Long header type 0x3
    Retry,
    /// Long header with version 0
    VersionNegotiation,
    /// Short header
    OneRtt,
}

impl PacketType {
    /// Two-bit type value of a long header
    pub fn long_type_bits(self) -> Option<u8> {
        match self {
            PacketType::Initial => Some(0x0),
            PacketType::ZeroRtt => Some(0x1),
            PacketType::Handshake => Some(0x2),
            PacketType::Retry => Some(0x3),
            PacketType::VersionNegotiation | PacketType::OneRtt => None,
        }
    }

    pub fn from_long_type_bits(bits: u8) -> PacketType {
        match bits & 0x03 {
            0x0 => PacketType::Initial,
            0x1 => PacketType::ZeroRtt,
            0x2 => PacketType::Handshake,
            _ => PacketType::Retry,
        }
    }

    pub fn is_long_header(self) -> bool {
        !matches!(self, PacketType::OneRtt)
    }

    /// Whether packets of this type carry a packet number and AEAD payload
    pub fn is_protected(self) -> bool {
        !matches!(self, PacketType::Retry | PacketType::VersionNegotiation)
    }

    pub fn space(self) -> PacketNumberSpace {
        match self {
            PacketType::Initial => PacketNumberSpace::Initial,
            PacketType::Handshake => PacketNumberSpace::Handshake,
            PacketType::ZeroRtt | PacketType::OneRtt => PacketNumberSpace::ApplicationData,
            PacketType::Retry | PacketType::VersionNegotiation => PacketNumberSpace::NoSpace,
        }
    }

    /// Encryption level protecting packets of this type
    pub fn encryption_level(self) -> Option<EncryptionLevel> {
        match self {
            PacketType::Initial => Some(EncryptionLevel::Initial),
            PacketType::ZeroRtt => Some(EncryptionLevel::ZeroRtt),
            PacketType::Handshake => Some(EncryptionLevel::Handshake),
            PacketType::OneRtt => Some(EncryptionLevel::OneRtt),
            PacketType::Retry | PacketType::VersionNegotiation => None,
        }
    }

    /// Packet type used to send at a real encryption level
    pub fn for_level(level: EncryptionLevel) -> Option<PacketType> {
        match level {
            EncryptionLevel::Initial => Some(PacketType::Initial),
            EncryptionLevel::ZeroRtt => Some(PacketType::ZeroRtt),
            EncryptionLevel::Handshake => Some(PacketType::Handshake),
            EncryptionLevel::OneRtt => Some(PacketType::OneRtt),
            EncryptionLevel::Best | EncryptionLevel::BestAppData => None,
        }
    }
}

// ============================================================================
// Length Field Helpers
// ============================================================================

/// Size of the long header Length field for a given value
///
/// The field is written with a fixed width (2 bytes up to 16383) so the
/// header length is known before the payload is final and the field can be
/// patched in place.
pub fn length_field_size(length: u64) -> usize {
    if length < 0x4000 {
        2
    } else if length < 0x4000_0000 {
        4
    } else {
        8
    }
}

/// Write `value` as a varint of exactly `size` bytes
fn put_varint_with_size(value: u64, size: usize, buf: &mut BytesMut) {
    let tag: u8 = match size {
        1 => 0x00,
        2 => 0x40,
        4 => 0x80,
        _ => 0xc0,
    };
    let bytes = value.to_be_bytes();
    let start = 8 - size;
    buf.put_u8(bytes[start] | tag);
    buf.put_slice(&bytes[start + 1..]);
}

fn read_cid(cursor: &mut Cursor<'_>) -> Result<ConnectionId> {
    let len = cursor.read_u8()? as usize;
    if len > MAX_CID_LENGTH {
        return Err(Error::MalformedPacket("connection id too long"));
    }
    ConnectionId::from_slice(cursor.read_bytes(len)?)
        .ok_or(Error::MalformedPacket("connection id too long"))
}

fn put_cid(cid: &ConnectionId, buf: &mut BytesMut) {
    buf.put_u8(cid.len() as u8);
    buf.put_slice(cid.as_bytes());
}

// ============================================================================
// Header Structures
// ============================================================================

/// Long Header of an Initial, 0-RTT or Handshake packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongHeader {
    pub packet_type: PacketType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    /// Address validation token (Initial only, empty otherwise)
    pub token: Bytes,
    /// Packet number + payload + AEAD tag
    pub length: u64,
    pub packet_number: TruncatedPn,
}

/// Short Header of a 1-RTT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortHeader {
    pub spin: bool,
    pub key_phase: bool,
    pub dcid: ConnectionId,
    pub packet_number: TruncatedPn,
}

/// Header of a packet carrying a packet number
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Long(LongHeader),
    Short(ShortHeader),
}

impl Header {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Header::Long(h) => h.packet_type,
            Header::Short(_) => PacketType::OneRtt,
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, Header::Long(_))
    }

    pub fn dcid(&self) -> &ConnectionId {
        match self {
            Header::Long(h) => &h.dcid,
            Header::Short(h) => &h.dcid,
        }
    }

    pub fn scid(&self) -> Option<&ConnectionId> {
        match self {
            Header::Long(h) => Some(&h.scid),
            Header::Short(_) => None,
        }
    }

    pub fn version(&self) -> Option<u32> {
        match self {
            Header::Long(h) => Some(h.version),
            Header::Short(_) => None,
        }
    }

    pub fn packet_number(&self) -> TruncatedPn {
        match self {
            Header::Long(h) => h.packet_number,
            Header::Short(h) => h.packet_number,
        }
    }

    /// Set the Length field of a long header (no-op for short headers)
    pub fn set_length(&mut self, length: u64) {
        if let Header::Long(h) = self {
            h.length = length;
        }
    }

    /// Offset of the packet number field from the start of the packet
    pub fn pn_offset(&self) -> usize {
        match self {
            Header::Long(h) => {
                let mut n = 1 + 4 + 1 + h.dcid.len() + 1 + h.scid.len();
                if h.packet_type == PacketType::Initial {
                    n += VarIntCodec::size(h.token.len() as u64) + h.token.len();
                }
                n + length_field_size(h.length)
            }
            Header::Short(h) => 1 + h.dcid.len(),
        }
    }

    /// Encoded header length, packet number included
    pub fn header_length(&self) -> usize {
        self.pn_offset() + self.packet_number().len()
    }

    /// Encode the header without protection
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Header::Long(h) => {
                let type_bits = h
                    .packet_type
                    .long_type_bits()
                    .filter(|_| h.packet_type.is_protected())
                    .ok_or(Error::MalformedPacket("not a protected long header type"))?;
                buf.put_u8(
                    HEADER_FORM_BIT | FIXED_BIT | (type_bits << 4) | h.packet_number.length_code(),
                );
                buf.put_u32(h.version);
                put_cid(&h.dcid, buf);
                put_cid(&h.scid, buf);
                if h.packet_type == PacketType::Initial {
                    VarIntCodec::put(h.token.len() as u64, buf)?;
                    buf.put_slice(&h.token);
                }
                if h.length > crate::types::VARINT_MAX {
                    return Err(Error::VarIntOutOfRange(h.length));
                }
                put_varint_with_size(h.length, length_field_size(h.length), buf);
                h.packet_number.encode(buf);
            }
            Header::Short(h) => {
                let mut first = FIXED_BIT | h.packet_number.length_code();
                if h.spin {
                    first |= SPIN_BIT;
                }
                if h.key_phase {
                    first |= KEY_PHASE_BIT;
                }
                buf.put_u8(first);
                buf.put_slice(h.dcid.as_bytes());
                h.packet_number.encode(buf);
            }
        }
        Ok(())
    }

    /// Parse an unprotected header
    ///
    /// `local_cid_len` is the length of the connection id this endpoint
    /// chose, which short headers carry without a length prefix. Returns the
    /// header and the number of bytes consumed.
    pub fn decode(buf: &[u8], local_cid_len: usize) -> Result<(Header, usize)> {
        let mut cursor = Cursor::new(buf);
        let first = cursor.read_u8()?;

        if first & HEADER_FORM_BIT == 0 {
            if first & FIXED_BIT == 0 {
                return Err(Error::MalformedPacket("fixed bit not set"));
            }
            let dcid = ConnectionId::from_slice(cursor.read_bytes(local_cid_len)?)
                .ok_or(Error::MalformedPacket("connection id too long"))?;
            let pn_len = TruncatedPn::length_from_code(first & PACKET_NUMBER_LENGTH_MASK)?;
            let packet_number = TruncatedPn::decode(&mut cursor, pn_len)?;
            let header = Header::Short(ShortHeader {
                spin: first & SPIN_BIT != 0,
                key_phase: first & KEY_PHASE_BIT != 0,
                dcid,
                packet_number,
            });
            return Ok((header, cursor.position()));
        }

        let version = cursor.read_u32()?;
        if version == VERSION_NEGOTIATION {
            return Err(Error::MalformedPacket("version negotiation has no protected header"));
        }
        let packet_type = PacketType::from_long_type_bits((first & LONG_PACKET_TYPE_MASK) >> 4);
        if packet_type == PacketType::Retry {
            return Err(Error::MalformedPacket("retry has no protected header"));
        }
        let dcid = read_cid(&mut cursor)?;
        let scid = read_cid(&mut cursor)?;
        let token = if packet_type == PacketType::Initial {
            Bytes::copy_from_slice(cursor.read_varint_prefixed()?)
        } else {
            Bytes::new()
        };
        let length = cursor.read_varint()?;
        let pn_len = TruncatedPn::length_from_code(first & PACKET_NUMBER_LENGTH_MASK)?;
        if length < pn_len as u64 {
            return Err(Error::MalformedPacket("length shorter than packet number"));
        }
        let packet_number = TruncatedPn::decode(&mut cursor, pn_len)?;

        let header = Header::Long(LongHeader {
            packet_type,
            version,
            dcid,
            scid,
            token,
            length,
            packet_number,
        });
        Ok((header, cursor.position()))
    }
}

// ============================================================================
// Protected Layout (first pass)
// ============================================================================

/// What can be learned from a packet before header protection is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLayout {
    pub packet_type: PacketType,
    /// Version of a long header packet
    pub version: Option<u32>,
    /// Offset of the packet number (protected packets only)
    pub pn_offset: Option<usize>,
    /// Bytes of the datagram belonging to this packet
    pub len: usize,
}

impl PacketLayout {
    /// Inspect the packet at the start of `buf`
    ///
    /// Long-header packets end where their Length field says; a short
    /// header, a Retry or a Version Negotiation packet takes the rest of
    /// the datagram.
    pub fn peek(buf: &[u8], local_cid_len: usize) -> Result<PacketLayout> {
        let mut cursor = Cursor::new(buf);
        let first = cursor.read_u8()?;

        if first & HEADER_FORM_BIT == 0 {
            if buf.len() < 1 + local_cid_len {
                return Err(Error::UnexpectedEnd);
            }
            return Ok(PacketLayout {
                packet_type: PacketType::OneRtt,
                version: None,
                pn_offset: Some(1 + local_cid_len),
                len: buf.len(),
            });
        }

        let version = cursor.read_u32()?;
        read_cid(&mut cursor)?;
        read_cid(&mut cursor)?;

        if version == VERSION_NEGOTIATION {
            return Ok(PacketLayout {
                packet_type: PacketType::VersionNegotiation,
                version: Some(version),
                pn_offset: None,
                len: buf.len(),
            });
        }

        let packet_type = PacketType::from_long_type_bits((first & LONG_PACKET_TYPE_MASK) >> 4);
        match packet_type {
            PacketType::Retry => Ok(PacketLayout {
                packet_type,
                version: Some(version),
                pn_offset: None,
                len: buf.len(),
            }),
            _ => {
                if packet_type == PacketType::Initial {
                    cursor.read_varint_prefixed()?;
                }
                let length = cursor.read_varint()?;
                let pn_offset = cursor.position();
                let len = usize::try_from(length)
                    .ok()
                    .and_then(|l| l.checked_add(pn_offset))
                    .filter(|end| *end <= buf.len())
                    .ok_or(Error::MalformedPacket("length exceeds datagram"))?;
                Ok(PacketLayout {
                    packet_type,
                    version: Some(version),
                    pn_offset: Some(pn_offset),
                    len,
                })
            }
        }
    }
}

// ============================================================================
// Packets Without Packet Numbers
// ============================================================================

/// Version Negotiation packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionNegotiationHeader {
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub supported_versions: Vec<u32>,
}

impl VersionNegotiationHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(HEADER_FORM_BIT | FIXED_BIT);
        buf.put_u32(VERSION_NEGOTIATION);
        put_cid(&self.dcid, buf);
        put_cid(&self.scid, buf);
        for v in &self.supported_versions {
            buf.put_u32(*v);
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let first = cursor.read_u8()?;
        if first & HEADER_FORM_BIT == 0 || cursor.read_u32()? != VERSION_NEGOTIATION {
            return Err(Error::MalformedPacket("not a version negotiation packet"));
        }
        let dcid = read_cid(&mut cursor)?;
        let scid = read_cid(&mut cursor)?;
        if cursor.remaining() % 4 != 0 {
            return Err(Error::MalformedPacket("truncated version list"));
        }
        let mut supported_versions = Vec::with_capacity(cursor.remaining() / 4);
        while !cursor.is_empty() {
            supported_versions.push(cursor.read_u32()?);
        }
        Ok(Self {
            dcid,
            scid,
            supported_versions,
        })
    }
}

/// Retry packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryHeader {
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    /// Destination id of the client's first Initial packet
    pub original_dcid: ConnectionId,
    pub token: Bytes,
}

impl RetryHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(HEADER_FORM_BIT | FIXED_BIT | LONG_PACKET_TYPE_MASK);
        buf.put_u32(self.version);
        put_cid(&self.dcid, buf);
        put_cid(&self.scid, buf);
        put_cid(&self.original_dcid, buf);
        buf.put_slice(&self.token);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let first = cursor.read_u8()?;
        if first & HEADER_FORM_BIT == 0 || (first & LONG_PACKET_TYPE_MASK) != LONG_PACKET_TYPE_MASK {
            return Err(Error::MalformedPacket("not a retry packet"));
        }
        let version = cursor.read_u32()?;
        let dcid = read_cid(&mut cursor)?;
        let scid = read_cid(&mut cursor)?;
        let original_dcid = read_cid(&mut cursor)?;
        let token = Bytes::copy_from_slice(cursor.read_rest());
        Ok(Self {
            version,
            dcid,
            scid,
            original_dcid,
            token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::DRAFT_13;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::from_slice(bytes).unwrap()
    }

    fn initial_header(token: &[u8]) -> Header {
        Header::Long(LongHeader {
            packet_type: PacketType::Initial,
            version: DRAFT_13,
            dcid: cid(&[1; 8]),
            scid: cid(&[2; 8]),
            token: Bytes::copy_from_slice(token),
            length: 100,
            packet_number: TruncatedPn::truncate(0x0102_0304, 0),
        })
    }

    mod long_header_tests {
        use super::*;

        #[test]
        fn test_long_header_first_byte_and_layout() {
            let header = initial_header(&[]);
            let mut buf = BytesMut::new();
            header.encode(&mut buf).unwrap();

            // 0xc0 | Initial (0) << 4 | 4-byte PN code (3)
            assert_eq!(buf[0], 0xc3);
            assert_eq!(&buf[1..5], &DRAFT_13.to_be_bytes());
            assert_eq!(buf[5], 8);
            // 1 + 4 + 1 + 8 + 1 + 8 = 23, token length 1, Length field 2
            assert_eq!(header.pn_offset(), 26);
            assert_eq!(header.header_length(), 30);
            assert_eq!(buf.len(), 30);
        }

        #[test]
        fn test_long_header_roundtrip_with_token() {
            let header = initial_header(b"retry-token");
            let mut buf = BytesMut::new();
            header.encode(&mut buf).unwrap();
            let (decoded, consumed) = Header::decode(&buf, 8).unwrap();
            assert_eq!(decoded, header);
            assert_eq!(consumed, header.header_length());
        }

        #[test]
        fn test_handshake_header_has_no_token() {
            let header = Header::Long(LongHeader {
                packet_type: PacketType::Handshake,
                version: DRAFT_13,
                dcid: cid(&[1; 8]),
                scid: cid(&[2; 8]),
                token: Bytes::new(),
                length: 20,
                packet_number: TruncatedPn::truncate(1, 0),
            });
            assert_eq!(header.pn_offset(), 25);
            let mut buf = BytesMut::new();
            header.encode(&mut buf).unwrap();
            assert_eq!(buf[0], 0xe0);
            let (decoded, _) = Header::decode(&buf, 8).unwrap();
            assert_eq!(decoded.packet_type(), PacketType::Handshake);
        }

        #[test]
        fn test_length_field_is_fixed_width() {
            assert_eq!(length_field_size(0), 2);
            assert_eq!(length_field_size(0x3fff), 2);
            assert_eq!(length_field_size(0x4000), 4);

            let mut buf = BytesMut::new();
            put_varint_with_size(5, 2, &mut buf);
            assert_eq!(&buf[..], &[0x40, 0x05]);
            assert_eq!(VarIntCodec::decode(&buf), Some((5, 2)));
        }

        #[test]
        fn test_oversized_connection_id_rejected() {
            let mut data = vec![0xc0];
            data.extend_from_slice(&DRAFT_13.to_be_bytes());
            data.push(21);
            data.extend_from_slice(&[0; 21]);
            assert_eq!(
                Header::decode(&data, 8),
                Err(Error::MalformedPacket("connection id too long"))
            );
        }

        #[test]
        fn test_truncated_long_header() {
            let header = initial_header(&[]);
            let mut buf = BytesMut::new();
            header.encode(&mut buf).unwrap();
            assert_eq!(Header::decode(&buf[..20], 8), Err(Error::UnexpectedEnd));
        }
    }

    mod short_header_tests {
        use super::*;

        #[test]
        fn test_short_header_bits() {
            let header = Header::Short(ShortHeader {
                spin: true,
                key_phase: true,
                dcid: cid(&[9; 4]),
                packet_number: TruncatedPn::truncate(5, 0),
            });
            let mut buf = BytesMut::new();
            header.encode(&mut buf).unwrap();
            // 0x40 | spin 0x20 | key phase 0x04 | 1-byte code 0
            assert_eq!(buf[0], 0x64);
            assert_eq!(header.pn_offset(), 5);

            let (decoded, consumed) = Header::decode(&buf, 4).unwrap();
            assert_eq!(decoded, header);
            assert_eq!(consumed, 6);
        }

        #[test]
        fn test_short_header_requires_fixed_bit() {
            assert_eq!(
                Header::decode(&[0x00, 1, 2, 3, 4, 5], 4),
                Err(Error::MalformedPacket("fixed bit not set"))
            );
        }
    }

    mod layout_tests {
        use super::*;

        #[test]
        fn test_peek_splits_coalesced_packets() {
            let mut datagram = BytesMut::new();
            let mut header = initial_header(&[]);
            header.set_length(10);
            header.encode(&mut datagram).unwrap();
            // PN (4 bytes) is part of Length, 6 more payload bytes
            datagram.put_slice(&[0xaa; 6]);
            let first_len = datagram.len();
            datagram.put_slice(&[0x40, 9, 9, 9, 9, 0x01, 0xbb]);

            let layout = PacketLayout::peek(&datagram, 4).unwrap();
            assert_eq!(layout.packet_type, PacketType::Initial);
            assert_eq!(layout.pn_offset, Some(26));
            assert_eq!(layout.len, first_len);

            let rest = PacketLayout::peek(&datagram[first_len..], 4).unwrap();
            assert_eq!(rest.packet_type, PacketType::OneRtt);
            assert_eq!(rest.pn_offset, Some(5));
            assert_eq!(rest.len, 7);
        }

        #[test]
        fn test_peek_rejects_length_past_datagram() {
            let mut datagram = BytesMut::new();
            let mut header = initial_header(&[]);
            header.set_length(500);
            header.encode(&mut datagram).unwrap();
            assert_eq!(
                PacketLayout::peek(&datagram, 8),
                Err(Error::MalformedPacket("length exceeds datagram"))
            );
        }
    }

    mod unnumbered_packet_tests {
        use super::*;

        #[test]
        fn test_version_negotiation_roundtrip() {
            let vn = VersionNegotiationHeader {
                dcid: cid(&[1, 2, 3]),
                scid: cid(&[4, 5]),
                supported_versions: vec![0xff00_000c, DRAFT_13],
            };
            let mut buf = BytesMut::new();
            vn.encode(&mut buf);
            assert_eq!(&buf[1..5], &[0, 0, 0, 0]);
            assert_eq!(
                PacketLayout::peek(&buf, 0).unwrap().packet_type,
                PacketType::VersionNegotiation
            );
            assert_eq!(VersionNegotiationHeader::decode(&buf).unwrap(), vn);
            assert!(Header::decode(&buf, 0).is_err());
        }

        #[test]
        fn test_version_list_must_be_whole() {
            let vn = VersionNegotiationHeader {
                dcid: cid(&[1]),
                scid: cid(&[2]),
                supported_versions: vec![DRAFT_13],
            };
            let mut buf = BytesMut::new();
            vn.encode(&mut buf);
            buf.put_u8(0xff);
            assert_eq!(
                VersionNegotiationHeader::decode(&buf),
                Err(Error::MalformedPacket("truncated version list"))
            );
        }

        #[test]
        fn test_retry_roundtrip() {
            let retry = RetryHeader {
                version: DRAFT_13,
                dcid: cid(&[1; 8]),
                scid: cid(&[7; 8]),
                original_dcid: cid(&[3; 8]),
                token: Bytes::from_static(b"address token"),
            };
            let mut buf = BytesMut::new();
            retry.encode(&mut buf);
            assert_eq!(buf[0], 0xf0);
            assert_eq!(PacketLayout::peek(&buf, 8).unwrap().packet_type, PacketType::Retry);
            assert_eq!(RetryHeader::decode(&buf).unwrap(), retry);
        }
    }
}
