//! # ACK Frames
//!
//! An ACK frame names its largest acknowledged packet, the number of
//! packets directly below it that are also acknowledged (the first block),
//! then alternating gap/block pairs walking downwards:
//!
//! ```text
//! range 0:  [largest - first_block, largest]
//! range n:  high = low(n-1) - gap - 2
//!           [high - block, high]
//! ```
//!
//! [`AckFrame::from_packet_numbers`] builds the frame from a pending set and
//! [`AckFrame::acked_ranges`] walks it back; together they round-trip any
//! finite set of packet numbers.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::types::PacketNumber;
use core::ops::RangeInclusive;
use tinyvec::TinyVec;

use super::types::{FRAME_TYPE_ACK, FRAME_TYPE_ACK_ECN};

/// One gap/block pair after the first block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckBlock {
    /// Unacknowledged packets between the previous range and this one, minus one
    pub gap: u64,
    /// Acknowledged packets in this range, minus one
    pub block: u64,
}

/// ECN counters of an ACK_ECN frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

/// ACK / ACK_ECN frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest_acknowledged: PacketNumber,
    /// Encoded ack delay (microseconds shifted by the ack delay exponent)
    pub ack_delay: u64,
    pub first_block: u64,
    pub blocks: TinyVec<[AckBlock; 8]>,
    pub ecn: Option<EcnCounts>,
}

impl AckFrame {
    /// Build an ACK frame covering `packet_numbers`
    ///
    /// Duplicates are ignored; returns None when the set is empty.
    pub fn from_packet_numbers(packet_numbers: &[PacketNumber], ack_delay: u64) -> Option<Self> {
        let mut sorted = packet_numbers.to_vec();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        sorted.dedup();

        let (&largest, rest) = sorted.split_first()?;
        let mut frame = AckFrame {
            largest_acknowledged: largest,
            ack_delay,
            first_block: 0,
            blocks: TinyVec::new(),
            ecn: None,
        };

        let mut previous = largest;
        let mut current: Option<AckBlock> = None;
        for &number in rest {
            if previous - number == 1 {
                match current.as_mut() {
                    Some(block) => block.block += 1,
                    None => frame.first_block += 1,
                }
            } else {
                if let Some(block) = current.take() {
                    frame.blocks.push(block);
                }
                current = Some(AckBlock {
                    gap: previous - number - 2,
                    block: 0,
                });
            }
            previous = number;
        }
        if let Some(block) = current {
            frame.blocks.push(block);
        }
        Some(frame)
    }

    /// Wire type of this frame
    pub fn frame_type(&self) -> u8 {
        if self.ecn.is_some() {
            FRAME_TYPE_ACK_ECN
        } else {
            FRAME_TYPE_ACK
        }
    }

    /// Acknowledged ranges, highest first
    ///
    /// # Errors
    /// Returns a frame error when the ranges run below packet number zero
    pub fn acked_ranges(&self) -> Result<Vec<RangeInclusive<PacketNumber>>> {
        let malformed = || Error::MalformedFrame {
            frame_type: self.frame_type(),
            reason: "ack range below zero",
        };

        let mut ranges = Vec::with_capacity(self.blocks.len() + 1);
        let mut high = self.largest_acknowledged;
        let mut low = high.checked_sub(self.first_block).ok_or_else(malformed)?;
        ranges.push(low..=high);
        for block in &self.blocks {
            high = low
                .checked_sub(block.gap)
                .and_then(|v| v.checked_sub(2))
                .ok_or_else(malformed)?;
            low = high.checked_sub(block.block).ok_or_else(malformed)?;
            ranges.push(low..=high);
        }
        Ok(ranges)
    }

    /// Every acknowledged packet number, highest first
    pub fn acked_packets(&self) -> Result<Vec<PacketNumber>> {
        Ok(self
            .acked_ranges()?
            .into_iter()
            .flat_map(|r| r.rev())
            .collect())
    }

    /// Whether `pn` is acknowledged by this frame
    pub fn acknowledges(&self, pn: PacketNumber) -> bool {
        self.acked_ranges()
            .map(|ranges| ranges.iter().any(|r| r.contains(&pn)))
            .unwrap_or(false)
    }

    /// Merge another ACK frame of the same space into this one
    pub fn merge(&self, other: &AckFrame) -> Result<AckFrame> {
        let mut numbers = self.acked_packets()?;
        numbers.extend(other.acked_packets()?);
        let ack_delay = if other.largest_acknowledged > self.largest_acknowledged {
            other.ack_delay
        } else {
            self.ack_delay
        };
        let mut merged = AckFrame::from_packet_numbers(&numbers, ack_delay).ok_or(
            Error::MalformedFrame {
                frame_type: FRAME_TYPE_ACK,
                reason: "empty ack",
            },
        )?;
        merged.ecn = self.ecn.or(other.ecn);
        Ok(merged)
    }
}
