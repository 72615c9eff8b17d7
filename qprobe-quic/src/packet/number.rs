//! # Truncated Packet Numbers
//!
//! Only the low bits of a packet number travel on the wire. The number of
//! bytes is chosen from the distance to the largest acknowledged packet so
//! that the receiver can rebuild the full value unambiguously.
//!
//! ## Encoding
//!
//! ```text
//! length = floor(log2(pn - largest_acked + 1)) / 8 + 1   (then 1, 2 or 4)
//!
//! bytes  mask         marker
//! 1      0x7f         0x00
//! 2      0x3fff       0x8000
//! 4      0x3fffffff   0xc0000000
//! ```
//!
//! The marker bits make the truncated value self-describing; the header's
//! packet-number-length bits carry the same length.
//!
//! ## Decoding
//!
//! [`TruncatedPn::join`] replaces the low bits of a reference number (the
//! largest packet number received in the space) with the truncated value.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::types::{Cursor, PacketNumber};
use bytes::{BufMut, BytesMut};

/// Truncated packet number as carried in a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncatedPn {
    /// Low bits of the packet number, without marker bits
    value: u32,
    /// Encoded length in bytes (1, 2 or 4)
    length: usize,
}

impl TruncatedPn {
    /// Truncate `pn` relative to the largest acknowledged packet number
    pub fn truncate(pn: PacketNumber, largest_acked: PacketNumber) -> Self {
        let distance = pn.saturating_sub(largest_acked) + 1;
        let log2 = 63 - distance.leading_zeros() as usize;
        let length = match log2 / 8 + 1 {
            1 => 1,
            2 => 2,
            _ => 4,
        };
        Self {
            value: (pn & Self::mask(length) as u64) as u32,
            length,
        }
    }

    /// Build from already-truncated bits
    pub fn new(value: u32, length: usize) -> Result<Self> {
        if !matches!(length, 1 | 2 | 4) {
            return Err(Error::MalformedPacket("packet number length"));
        }
        Ok(Self {
            value: value & Self::mask(length),
            length,
        })
    }

    /// Value bits for a given encoded length
    pub fn mask(length: usize) -> u32 {
        match length {
            1 => 0x7f,
            2 => 0x3fff,
            _ => 0x3fff_ffff,
        }
    }

    /// Leading marker bits for a given encoded length
    pub fn marker(length: usize) -> u32 {
        match length {
            1 => 0x00,
            2 => 0x8000,
            _ => 0xc000_0000,
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Two-bit length code stored in the header's first byte
    pub fn length_code(&self) -> u8 {
        match self.length {
            1 => 0b00,
            2 => 0b01,
            _ => 0b11,
        }
    }

    /// Length in bytes for a header length code
    pub fn length_from_code(code: u8) -> Result<usize> {
        match code & 0x03 {
            0b00 => Ok(1),
            0b01 => Ok(2),
            0b11 => Ok(4),
            _ => Err(Error::MalformedPacket("reserved packet number length")),
        }
    }

    /// Length in bytes announced by the marker bits of a first PN byte
    pub fn length_from_marker(first: u8) -> usize {
        match first >> 6 {
            0b00 | 0b01 => 1,
            0b10 => 2,
            _ => 4,
        }
    }

    /// Rebuild the full packet number from a reference number
    ///
    /// The low bits of `reference` are replaced by the truncated value;
    /// when that lands more than half a window away from the reference,
    /// the neighbouring window is used instead.
    pub fn join(&self, reference: PacketNumber) -> PacketNumber {
        let window = Self::mask(self.length) as u64 + 1;
        let half = window / 2;
        let candidate = (reference & !(window - 1)) | self.value as u64;
        if candidate + half <= reference {
            candidate + window
        } else if candidate > reference + half && candidate >= window {
            candidate - window
        } else {
            candidate
        }
    }

    /// Write the marked value
    pub fn encode(&self, buf: &mut BytesMut) {
        let marked = self.value | Self::marker(self.length);
        match self.length {
            1 => buf.put_u8(marked as u8),
            2 => buf.put_u16(marked as u16),
            _ => buf.put_u32(marked),
        }
    }

    /// Marked value as big-endian bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4);
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Read a value of known length, stripping the marker bits
    pub fn decode(cursor: &mut Cursor<'_>, length: usize) -> Result<Self> {
        let bytes = cursor.read_bytes(length)?;
        Self::from_bytes(bytes)
    }

    /// Parse unprotected packet number bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw = bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32);
        Self::new(raw, bytes.len())
    }
}
