//! # QUIC Frames
//!
//! The closed frame catalog, its wire codec and ACK range handling.

pub mod ack;
pub mod parse;
pub mod types;

pub use ack::{AckBlock, AckFrame, EcnCounts};
pub use parse::{decode_frame, decode_frames, FrameIterator};
pub use types::*;
