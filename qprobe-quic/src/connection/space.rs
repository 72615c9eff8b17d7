//! Packet number state of one space.

#![forbid(unsafe_code)]

use crate::frames::AckFrame;
use crate::packet::TruncatedPn;
use crate::types::PacketNumber;
use std::collections::BTreeMap;
use std::time::Instant;

/// Send counter, received set and acknowledgement progress of a space
#[derive(Debug, Clone, Default)]
pub struct SpaceState {
    next_packet_number: PacketNumber,
    largest_received: Option<PacketNumber>,
    largest_acknowledged: Option<PacketNumber>,
    /// Received packet numbers and when they arrived
    received: BTreeMap<PacketNumber, Instant>,
}

impl SpaceState {
    /// Assign the next packet number; numbers are never reused
    pub fn take_packet_number(&mut self) -> PacketNumber {
        let pn = self.next_packet_number;
        self.next_packet_number += 1;
        pn
    }

    pub fn next_packet_number(&self) -> PacketNumber {
        self.next_packet_number
    }

    pub fn largest_received(&self) -> Option<PacketNumber> {
        self.largest_received
    }

    pub fn largest_acknowledged(&self) -> Option<PacketNumber> {
        self.largest_acknowledged
    }

    /// Truncate an outgoing packet number against the peer's progress
    pub fn truncate(&self, pn: PacketNumber) -> TruncatedPn {
        TruncatedPn::truncate(pn, self.largest_acknowledged.unwrap_or(0))
    }

    /// Recover the full number of a received packet
    pub fn join(&self, truncated: TruncatedPn) -> PacketNumber {
        truncated.join(self.largest_received.map_or(0, |l| l + 1))
    }

    /// Note a successfully opened packet
    pub fn on_packet_opened(&mut self, pn: PacketNumber) {
        if self.largest_received.map_or(true, |l| pn > l) {
            self.largest_received = Some(pn);
        }
    }

    /// Queue `pn` for acknowledgement; returns true for a duplicate
    pub fn record_received(&mut self, pn: PacketNumber, received_at: Instant) -> bool {
        if self.received.contains_key(&pn) {
            return true;
        }
        self.received.insert(pn, received_at);
        false
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.received.is_empty()
    }

    /// Peer acknowledged up to `pn`
    pub fn on_ack_received(&mut self, largest: PacketNumber) {
        if self.largest_acknowledged.map_or(true, |l| largest > l) {
            self.largest_acknowledged = Some(largest);
        }
    }

    /// ACK frame covering every received packet
    ///
    /// The delay is measured from the arrival of the largest packet and
    /// scaled down by `ack_delay_exponent`.
    pub fn ack_frame(&self, now: Instant, ack_delay_exponent: u8) -> Option<AckFrame> {
        let numbers: Vec<PacketNumber> = self.received.keys().copied().collect();
        let mut frame = AckFrame::from_packet_numbers(&numbers, 0)?;
        if let Some(received_at) = self.received.get(&frame.largest_acknowledged) {
            let delay = now.saturating_duration_since(*received_at).as_micros() as u64;
            frame.ack_delay = delay >> ack_delay_exponent.min(20);
        }
        Some(frame)
    }
}
