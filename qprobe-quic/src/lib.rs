//! qprobe-quic: Sans-IO QUIC engine for conformance probing
//!
//! Implements the draft-era QUIC transport (drafts 12 and 13) the way a test
//! endpoint needs it: every packet is built and parsed explicitly, nothing is
//! hidden behind a socket, and protocol violations are reported to the
//! caller instead of being silently repaired.
//!
//! # Architecture
//!
//! - **Pure state**: no I/O and no clock; callers pass datagrams and instants
//! - **Zero-copy parsing**: frames borrow from received datagrams via `bytes::Bytes`
//! - **Crypto-agnostic**: AEAD, header protection and TLS are collaborator traits
//! - **Explicit sum types**: frames, headers and packets are enums, not class trees
//!
//! # Module Organization
//!
//! - `types`: varints, connection ids, stream ids, shared constants
//! - `version`: supported versions, ALPN derivation, negotiation
//! - `frames`: frame catalog with encoding and decoding
//! - `packet`: headers, packet numbers, header protection
//! - `crypto`: key schedule and collaborator traits
//! - `transport`: transport parameter extension
//! - `stream`: reassembly, per-stream state and send buffers
//! - `flow_control`: connection and stream credit
//! - `recovery`: RTT estimation and retransmission bookkeeping
//! - `connection`: the per-attempt aggregate tying it together

pub mod connection;
pub mod crypto;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod packet;
pub mod recovery;
pub mod stream;
pub mod transport;
pub mod types;
pub mod version;

// Re-export key types
pub use connection::{
    Connection, ConnectionConfig, ConnectionState, Decoded, DecodedPacket, Delivery,
    EncodedPacket, StreamDelivery,
};
pub use crypto::{
    CryptoProvider, DirectionalEncryptionLevel, EncryptionLevel, KeyDirection, TlsSession,
};
pub use error::{Error, ProtocolViolation, Result, TransportError};
pub use flow_control::{FlowController, Reservation};
pub use frames::{AckFrame, Frame};
pub use packet::{FramedPacket, Header, Packet, PacketId, PacketType};
pub use recovery::{FixedIntervalPolicy, RetransmitBuffer, RetransmitPolicy, RttEstimator};
pub use stream::{SendBuffers, Stream, Streams};
pub use transport::TransportParameters;
pub use types::{ConnectionId, PacketNumber, PacketNumberSpace, Side, StreamId};
pub use version::{VersionRange, DEFAULT_VERSION, DRAFT_12, DRAFT_13};
