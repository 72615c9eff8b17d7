//! # Retransmission
//!
//! Every sent packet with retransmittable frames is kept per packet number
//! space until it is acknowledged, declared lost or its space is dropped.
//!
//! Two things declare a packet lost:
//! - an ACK whose ranges skip it (packets in the gaps below the largest
//!   acknowledged one)
//! - the [`RetransmitPolicy`], checked on every timer tick
//!
//! Lost frames come back as [`RetransmitBatch`]es. A batch holding the
//! first Initial packet (the ClientHello at crypto offset zero) is resent
//! as a whole Initial packet; any other batch is re-queued frame by frame
//! at its original level.

#![forbid(unsafe_code)]

use crate::crypto::EncryptionLevel;
use crate::error::Result;
use crate::frames::{AckFrame, Frame};
use crate::types::{PacketNumber, PacketNumberSpace};
use core::fmt::Debug;
use core::time::Duration;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, trace};

/// When a sent, unacknowledged packet is considered lost
pub trait RetransmitPolicy: Debug + Send + Sync {
    /// Policy name used in logs
    fn name(&self) -> &'static str;

    /// How often [`RetransmitBuffer::expire`] should be called
    fn tick_interval(&self) -> Duration;

    /// Whether a packet sent at `sent_at` is due for retransmission at `now`
    fn is_due(&self, sent_at: Instant, now: Instant) -> bool;
}

/// Resend anything unacknowledged after a fixed delay
///
/// No backoff, no RTT awareness. Keeps conformance runs deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedIntervalPolicy {
    pub timeout: Duration,
    pub tick: Duration,
}

impl FixedIntervalPolicy {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
    pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            tick: Self::DEFAULT_TICK,
        }
    }
}

impl Default for FixedIntervalPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT)
    }
}

impl RetransmitPolicy for FixedIntervalPolicy {
    fn name(&self) -> &'static str {
        "fixed-interval"
    }

    fn tick_interval(&self) -> Duration {
        self.tick
    }

    fn is_due(&self, sent_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(sent_at) > self.timeout
    }
}

/// Retransmittable frames of one sent packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmitBatch {
    pub space: PacketNumberSpace,
    pub packet_number: PacketNumber,
    pub level: EncryptionLevel,
    pub sent_at: Instant,
    pub frames: Vec<Frame>,
}

impl RetransmitBatch {
    /// Whether these frames came from the client's first Initial packet
    pub fn is_first_initial(&self) -> bool {
        self.level == EncryptionLevel::Initial
            && matches!(self.frames.first(), Some(Frame::Crypto(c)) if c.offset == 0)
    }
}

/// Result of processing one ACK frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// Packets we sent that are now acknowledged
    pub acknowledged: Vec<PacketNumber>,
    /// Acknowledged numbers we never sent
    pub unknown: Vec<PacketNumber>,
    /// Packets skipped by the ACK ranges
    pub lost: Vec<RetransmitBatch>,
}

#[derive(Debug, Clone, Default)]
struct SpaceBuffer {
    sent: BTreeSet<PacketNumber>,
    pending: BTreeMap<PacketNumber, RetransmitBatch>,
}

/// Unacknowledged frames of every packet number space
#[derive(Debug, Clone, Default)]
pub struct RetransmitBuffer {
    spaces: [SpaceBuffer; 3],
}

impl RetransmitBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sent packet; its retransmittable frames are kept
    pub fn on_packet_sent(
        &mut self,
        space: PacketNumberSpace,
        packet_number: PacketNumber,
        level: EncryptionLevel,
        frames: &[Frame],
        sent_at: Instant,
    ) {
        let Some(i) = space.index() else {
            return;
        };
        let buffer = &mut self.spaces[i];
        buffer.sent.insert(packet_number);

        let frames: Vec<Frame> = frames
            .iter()
            .filter(|f| f.is_retransmittable())
            .cloned()
            .collect();
        if !frames.is_empty() {
            buffer.pending.insert(
                packet_number,
                RetransmitBatch {
                    space,
                    packet_number,
                    level,
                    sent_at,
                    frames,
                },
            );
        }
    }

    /// Process an ACK frame received in `space`
    ///
    /// # Errors
    /// Returns a frame error when the ACK ranges run below zero
    pub fn on_ack(&mut self, space: PacketNumberSpace, ack: &AckFrame) -> Result<AckOutcome> {
        let mut outcome = AckOutcome::default();
        let Some(i) = space.index() else {
            return Ok(outcome);
        };
        let buffer = &mut self.spaces[i];
        let ranges = ack.acked_ranges()?;

        for range in &ranges {
            let sent: Vec<PacketNumber> = buffer.sent.range(range.clone()).copied().collect();
            for pn in &sent {
                buffer.pending.remove(pn);
            }
            // Only the bounds can be checked without walking the whole range
            for pn in [*range.start(), *range.end()] {
                if !buffer.sent.contains(&pn) && !outcome.unknown.contains(&pn) {
                    outcome.unknown.push(pn);
                }
            }
            outcome.acknowledged.extend(sent);
        }

        // Gaps between consecutive ranges, highest first
        for pair in ranges.windows(2) {
            let (upper, lower) = (&pair[0], &pair[1]);
            let gap = (*lower.end() + 1)..*upper.start();
            let missing: Vec<PacketNumber> = buffer.pending.range(gap).map(|(pn, _)| *pn).collect();
            for pn in missing {
                if let Some(batch) = buffer.pending.remove(&pn) {
                    trace!(?space, packet_number = pn, "packet skipped by ACK ranges");
                    outcome.lost.push(batch);
                }
            }
        }

        for pn in &outcome.unknown {
            debug!(?space, packet_number = pn, "unknown packet was acknowledged");
        }
        Ok(outcome)
    }

    /// Remove and return every batch the policy considers due, oldest first
    pub fn expire(&mut self, now: Instant, policy: &dyn RetransmitPolicy) -> Vec<RetransmitBatch> {
        let mut batch = Vec::new();
        for buffer in &mut self.spaces {
            let due: Vec<PacketNumber> = buffer
                .pending
                .iter()
                .filter(|(_, b)| policy.is_due(b.sent_at, now))
                .map(|(pn, _)| *pn)
                .collect();
            for pn in due {
                if let Some(b) = buffer.pending.remove(&pn) {
                    debug!(
                        space = ?b.space,
                        packet_number = pn,
                        policy = policy.name(),
                        "packet lost"
                    );
                    batch.push(b);
                }
            }
        }
        batch.sort_by_key(|b| b.sent_at);
        batch
    }

    /// Forget the pending frames of one space
    pub fn clear(&mut self, space: PacketNumberSpace) {
        if let Some(i) = space.index() {
            if !self.spaces[i].pending.is_empty() {
                debug!(?space, "emptying retransmission buffer");
            }
            self.spaces[i].pending.clear();
        }
    }

    pub fn clear_all(&mut self) {
        for space in PacketNumberSpace::ALL {
            self.clear(space);
        }
    }

    /// Frames pending in `space`
    pub fn pending_len(&self, space: PacketNumberSpace) -> usize {
        space.index().map_or(0, |i| self.spaces[i].pending.len())
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.iter().all(|s| s.pending.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::CryptoFrame;
    use bytes::Bytes;

    fn crypto(offset: u64) -> Frame {
        Frame::Crypto(CryptoFrame {
            offset,
            data: Bytes::from_static(b"hs"),
        })
    }

    mod policy_tests {
        use super::*;

        #[test]
        fn test_fixed_interval_threshold() {
            let policy = FixedIntervalPolicy::default();
            let sent = Instant::now();
            assert_eq!(policy.tick_interval(), Duration::from_millis(100));
            assert!(!policy.is_due(sent, sent + Duration::from_millis(500)));
            assert!(policy.is_due(sent, sent + Duration::from_millis(501)));
        }
    }

    mod buffer_tests {
        use super::*;

        #[test]
        fn test_ack_removes_and_gaps_are_lost() {
            let now = Instant::now();
            let mut buffer = RetransmitBuffer::new();
            for pn in 0..6 {
                buffer.on_packet_sent(
                    PacketNumberSpace::ApplicationData,
                    pn,
                    EncryptionLevel::OneRtt,
                    &[Frame::Ping],
                    now,
                );
            }
            // Acks 0..=1 and 4..=5, skipping 2 and 3
            let ack = AckFrame::from_packet_numbers(&[0, 1, 4, 5], 0).unwrap();
            let outcome = buffer.on_ack(PacketNumberSpace::ApplicationData, &ack).unwrap();
            assert_eq!(outcome.acknowledged, vec![4, 5, 0, 1]);
            assert!(outcome.unknown.is_empty());
            let lost: Vec<_> = outcome.lost.iter().map(|b| b.packet_number).collect();
            assert_eq!(lost, vec![2, 3]);
            assert!(buffer.is_empty());
        }

        #[test]
        fn test_unknown_packet_reported() {
            let mut buffer = RetransmitBuffer::new();
            let ack = AckFrame::from_packet_numbers(&[9], 0).unwrap();
            let outcome = buffer.on_ack(PacketNumberSpace::Handshake, &ack).unwrap();
            assert_eq!(outcome.unknown, vec![9]);
        }

        #[test]
        fn test_ack_only_packets_not_buffered() {
            let mut buffer = RetransmitBuffer::new();
            let ack = AckFrame::from_packet_numbers(&[0], 0).unwrap();
            buffer.on_packet_sent(
                PacketNumberSpace::Initial,
                0,
                EncryptionLevel::Initial,
                &[Frame::Ack(ack), Frame::Padding(100)],
                Instant::now(),
            );
            assert!(buffer.is_empty());
        }

        #[test]
        fn test_expire_oldest_first_and_clear() {
            let start = Instant::now();
            let policy = FixedIntervalPolicy::default();
            let mut buffer = RetransmitBuffer::new();
            buffer.on_packet_sent(
                PacketNumberSpace::Handshake,
                0,
                EncryptionLevel::Handshake,
                &[crypto(0)],
                start + Duration::from_millis(10),
            );
            buffer.on_packet_sent(
                PacketNumberSpace::Initial,
                0,
                EncryptionLevel::Initial,
                &[crypto(0)],
                start,
            );
            buffer.on_packet_sent(
                PacketNumberSpace::ApplicationData,
                0,
                EncryptionLevel::OneRtt,
                &[Frame::Ping],
                start + Duration::from_millis(400),
            );

            let lost = buffer.expire(start + Duration::from_millis(600), &policy);
            assert_eq!(lost.len(), 2);
            assert_eq!(lost[0].space, PacketNumberSpace::Initial);
            assert!(lost[0].is_first_initial());
            assert!(!lost[1].is_first_initial());
            assert_eq!(buffer.pending_len(PacketNumberSpace::ApplicationData), 1);

            buffer.clear_all();
            assert!(buffer.is_empty());
        }
    }
}
