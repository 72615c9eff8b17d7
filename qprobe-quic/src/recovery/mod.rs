//! RTT estimation and retransmission of lost frames.

pub mod retransmit;
pub mod rtt;

pub use retransmit::{AckOutcome, FixedIntervalPolicy, RetransmitBatch, RetransmitBuffer, RetransmitPolicy};
pub use rtt::{decode_ack_delay, RttEstimator, SentPacketLog};
