//! # Header Protection
//!
//! The first byte and the packet number bytes are masked with five bytes
//! derived from a 16-byte ciphertext sample. The sample starts 4 bytes after
//! the packet number field begins, whatever the actual PN length, so the
//! receiver can take it before knowing that length.

#![forbid(unsafe_code)]

use super::header::{LONG_PROTECTED_BITS, PACKET_NUMBER_LENGTH_MASK, SHORT_PROTECTED_BITS};
use super::number::TruncatedPn;
use crate::crypto::{HeaderProtectionCipher, SAMPLE_LEN};
use crate::error::{Error, Result};
use core::ops::Range;

/// Distance from the start of the PN field to the sample
pub const SAMPLE_OFFSET_FROM_PN: usize = 4;

/// Byte range of the header-protection sample
pub fn sample_range(pn_offset: usize) -> Range<usize> {
    let start = pn_offset + SAMPLE_OFFSET_FROM_PN;
    start..start + SAMPLE_LEN
}

/// The 16-byte ciphertext sample of a packet
pub fn packet_sample(packet: &[u8], pn_offset: usize) -> Result<&[u8]> {
    packet
        .get(sample_range(pn_offset))
        .ok_or(Error::MalformedPacket("packet too short for header protection sample"))
}

fn first_byte_mask(first: u8) -> u8 {
    if first & 0x80 != 0 {
        LONG_PROTECTED_BITS
    } else {
        SHORT_PROTECTED_BITS
    }
}

/// Mask the first byte and the `pn_len` packet number bytes of a sealed packet
pub fn apply(
    packet: &mut [u8],
    pn_offset: usize,
    pn_len: usize,
    hp: &dyn HeaderProtectionCipher,
) -> Result<()> {
    let mask = hp.mask(packet_sample(packet, pn_offset)?)?;
    packet[0] ^= mask[0] & first_byte_mask(packet[0]);
    for (byte, m) in packet[pn_offset..pn_offset + pn_len].iter_mut().zip(&mask[1..]) {
        *byte ^= m;
    }
    Ok(())
}

/// Unmask a received packet in place, returning the packet number length
pub fn remove(packet: &mut [u8], pn_offset: usize, hp: &dyn HeaderProtectionCipher) -> Result<usize> {
    let mask = hp.mask(packet_sample(packet, pn_offset)?)?;
    packet[0] ^= mask[0] & first_byte_mask(packet[0]);
    let pn_len = TruncatedPn::length_from_code(packet[0] & PACKET_NUMBER_LENGTH_MASK)?;
    for (byte, m) in packet[pn_offset..pn_offset + pn_len].iter_mut().zip(&mask[1..]) {
        *byte ^= m;
    }
    Ok(pn_len)
}
