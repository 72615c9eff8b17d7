//! # RTT Estimation
//!
//! Round-trip samples come from ACK frames that acknowledge the largest
//! packet sent at the time. The peer's reported ack delay (scaled by its
//! ack delay exponent) is subtracted when that leaves a sample above the
//! minimum RTT.
//!
//! ```text
//! first sample:  smoothed = latest, rttvar = latest / 2
//! afterwards:    rttvar   = 3/4 rttvar + 1/4 |smoothed - latest|
//!                smoothed = 7/8 smoothed + 1/8 latest
//! ```

#![forbid(unsafe_code)]

use crate::frames::AckFrame;
use crate::transport::parameters::DEFAULT_ACK_DELAY_EXPONENT;
use crate::types::{PacketNumber, PacketNumberSpace};
use core::time::Duration;
use std::collections::BTreeMap;
use std::time::Instant;

/// RTT Estimator
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    smoothed_rtt: Option<Duration>,
    rtt_var: Duration,
    min_rtt: Option<Duration>,
    latest_rtt: Duration,
    /// Largest ack delay reported for a packet that was not ACK-only
    max_ack_delay: Duration,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw round trip and the peer's ack delay
    pub fn update(&mut self, round_trip: Duration, ack_delay: Duration, ack_only: bool) {
        let min_rtt = match self.min_rtt {
            Some(min) if min <= round_trip => min,
            _ => round_trip,
        };
        self.min_rtt = Some(min_rtt);

        self.latest_rtt = round_trip;
        if round_trip - min_rtt > ack_delay {
            self.latest_rtt = round_trip - ack_delay;
        }

        if !ack_only && ack_delay > self.max_ack_delay {
            self.max_ack_delay = ack_delay;
        }

        match self.smoothed_rtt {
            None => {
                self.smoothed_rtt = Some(self.latest_rtt);
                self.rtt_var = self.latest_rtt / 2;
            }
            Some(smoothed) => {
                let rttvar_sample = if smoothed > self.latest_rtt {
                    smoothed - self.latest_rtt
                } else {
                    self.latest_rtt - smoothed
                };
                self.rtt_var = (self.rtt_var * 3 + rttvar_sample) / 4;
                self.smoothed_rtt = Some((smoothed * 7 + self.latest_rtt) / 8);
            }
        }
    }

    /// Smoothed RTT, zero before the first sample
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt.unwrap_or_default()
    }

    pub fn rtt_var(&self) -> Duration {
        self.rtt_var
    }

    pub fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    pub fn max_ack_delay(&self) -> Duration {
        self.max_ack_delay
    }

    pub fn has_sample(&self) -> bool {
        self.smoothed_rtt.is_some()
    }
}

/// Decode an ACK frame's delay field
pub fn decode_ack_delay(encoded: u64, exponent: Option<u8>) -> Duration {
    let exponent = match exponent {
        Some(0) | None => DEFAULT_ACK_DELAY_EXPONENT,
        Some(e) => e,
    };
    Duration::from_micros(encoded.saturating_mul(1u64 << exponent.min(20)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SentPacketInfo {
    sent_at: Instant,
    ack_only: bool,
    size: usize,
}

/// Send times of packets per space, used to turn ACKs into RTT samples
#[derive(Debug, Clone, Default)]
pub struct SentPacketLog {
    spaces: [BTreeMap<PacketNumber, SentPacketInfo>; 3],
}

impl SentPacketLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_packet_sent(
        &mut self,
        space: PacketNumberSpace,
        packet_number: PacketNumber,
        sent_at: Instant,
        ack_only: bool,
        size: usize,
    ) {
        if let Some(i) = space.index() {
            self.spaces[i].insert(
                packet_number,
                SentPacketInfo {
                    sent_at,
                    ack_only,
                    size,
                },
            );
        }
    }

    /// Largest packet number sent in `space`
    pub fn largest_sent(&self, space: PacketNumberSpace) -> Option<PacketNumber> {
        space
            .index()
            .and_then(|i| self.spaces[i].keys().next_back().copied())
    }

    /// Size of a sent packet, if still tracked
    pub fn size_of(&self, space: PacketNumberSpace, packet_number: PacketNumber) -> Option<usize> {
        space
            .index()
            .and_then(|i| self.spaces[i].get(&packet_number))
            .map(|p| p.size)
    }

    /// Update `rtt` from an ACK received at `received_at`
    ///
    /// Only the largest acknowledged packet is used; returns whether a
    /// sample was taken.
    pub fn on_ack(
        &self,
        space: PacketNumberSpace,
        ack: &AckFrame,
        received_at: Instant,
        ack_delay_exponent: Option<u8>,
        rtt: &mut RttEstimator,
    ) -> bool {
        let Some(sent) = space
            .index()
            .and_then(|i| self.spaces[i].get(&ack.largest_acknowledged))
        else {
            return false;
        };
        let round_trip = received_at.saturating_duration_since(sent.sent_at);
        let ack_delay = decode_ack_delay(ack.ack_delay, ack_delay_exponent);
        rtt.update(round_trip, ack_delay, sent.ack_only);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    mod rtt_estimator_tests {
        use super::*;

        #[test]
        fn test_first_sample() {
            // smoothed = latest, rttvar = latest / 2
            let mut rtt = RttEstimator::new();
            assert!(!rtt.has_sample());
            rtt.update(ms(100), Duration::ZERO, false);
            assert_eq!(rtt.smoothed_rtt(), ms(100));
            assert_eq!(rtt.rtt_var(), ms(50));
            assert_eq!(rtt.min_rtt(), Some(ms(100)));
        }

        #[test]
        fn test_weighted_averages() {
            let mut rtt = RttEstimator::new();
            rtt.update(ms(100), Duration::ZERO, false);
            rtt.update(ms(180), Duration::ZERO, false);
            // rttvar = 3/4 * 50 + 1/4 * 80 = 57.5, smoothed = 7/8 * 100 + 1/8 * 180 = 110
            assert_eq!(rtt.smoothed_rtt(), ms(110));
            assert_eq!(rtt.rtt_var(), Duration::from_micros(57_500));
            assert_eq!(rtt.min_rtt(), Some(ms(100)));
        }

        #[test]
        fn test_ack_delay_subtracted_only_above_min() {
            let mut rtt = RttEstimator::new();
            rtt.update(ms(100), ms(10), false);
            // latest - min = 0, not above the delay
            assert_eq!(rtt.latest_rtt(), ms(100));

            rtt.update(ms(150), ms(20), false);
            assert_eq!(rtt.latest_rtt(), ms(130));
            assert_eq!(rtt.max_ack_delay(), ms(20));

            rtt.update(ms(150), ms(40), true);
            assert_eq!(rtt.max_ack_delay(), ms(20));
        }

        #[test]
        fn test_ack_delay_exponent_scaling() {
            // 2^3 microseconds per unit by default
            assert_eq!(decode_ack_delay(125, None), Duration::from_micros(1000));
            assert_eq!(decode_ack_delay(125, Some(0)), Duration::from_micros(1000));
            assert_eq!(decode_ack_delay(1, Some(10)), Duration::from_micros(1024));
        }
    }

    mod sent_packet_log_tests {
        use super::*;

        #[test]
        fn test_sample_from_largest_acknowledged() {
            let start = Instant::now();
            let mut log = SentPacketLog::new();
            log.on_packet_sent(PacketNumberSpace::Handshake, 3, start, false, 1200);
            log.on_packet_sent(PacketNumberSpace::Handshake, 4, start + ms(5), false, 80);
            assert_eq!(log.largest_sent(PacketNumberSpace::Handshake), Some(4));
            assert_eq!(log.size_of(PacketNumberSpace::Handshake, 3), Some(1200));

            let ack = AckFrame::from_packet_numbers(&[3, 4], 0).unwrap();
            let mut rtt = RttEstimator::new();
            assert!(log.on_ack(PacketNumberSpace::Handshake, &ack, start + ms(45), None, &mut rtt));
            assert_eq!(rtt.latest_rtt(), ms(40));

            // Wrong space: nothing to sample
            assert!(!log.on_ack(PacketNumberSpace::Initial, &ack, start + ms(45), None, &mut rtt));
        }
    }
}
