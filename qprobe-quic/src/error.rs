//! # Engine Error Types
//!
//! Errors are grouped the way the connection reacts to them:
//! - **Wire**: truncated or malformed input, the packet is dropped
//! - **Crypto**: missing keys (buffer and retry) or AEAD failure (drop)
//! - **Protocol**: peer misbehaviour surfaced as [`ProtocolViolation`]
//! - **Negotiation**: fatal to the connection attempt, never retried
//! - **Io**: transport failures reported by the owning agent

#![forbid(unsafe_code)]

use crate::crypto::EncryptionLevel;
use thiserror::Error;

/// Transport Error Codes carried in CONNECTION_CLOSE frames (16-bit field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TransportError {
    /// No error (0x0) - graceful shutdown
    NoError = 0x0,

    /// Internal Error (0x1)
    InternalError = 0x1,

    /// Server Busy (0x2)
    ServerBusy = 0x2,

    /// Flow Control Error (0x3) - peer exceeded advertised credit
    FlowControlError = 0x3,

    /// Stream ID Error (0x4) - stream id invalid for its type or beyond limit
    StreamIdError = 0x4,

    /// Stream State Error (0x5) - frame received in invalid stream state
    StreamStateError = 0x5,

    /// Final Offset Error (0x6) - conflicting or exceeded final offset
    FinalOffsetError = 0x6,

    /// Frame Format Error (0x7)
    FrameFormatError = 0x7,

    /// Transport Parameter Error (0x8)
    TransportParameterError = 0x8,

    /// Version Negotiation Error (0x9)
    VersionNegotiationError = 0x9,

    /// Protocol Violation (0xa)
    ProtocolViolation = 0xa,

    /// Unsolicited Path Response (0xb)
    UnsolicitedPathResponse = 0xb,
}

impl TransportError {
    /// Wire value of this error code
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Map a wire value back to a known code
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x0 => TransportError::NoError,
            0x1 => TransportError::InternalError,
            0x2 => TransportError::ServerBusy,
            0x3 => TransportError::FlowControlError,
            0x4 => TransportError::StreamIdError,
            0x5 => TransportError::StreamStateError,
            0x6 => TransportError::FinalOffsetError,
            0x7 => TransportError::FrameFormatError,
            0x8 => TransportError::TransportParameterError,
            0x9 => TransportError::VersionNegotiationError,
            0xa => TransportError::ProtocolViolation,
            0xb => TransportError::UnsolicitedPathResponse,
            _ => return None,
        })
    }
}

/// Error category used by callers to pick a reaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Drop the packet, keep the connection
    Wire,
    /// Buffer (missing keys) or drop (AEAD failure)
    Crypto,
    /// Peer violated the protocol
    Protocol,
    /// Fatal to the connection attempt
    Negotiation,
    /// Local transport or state failure
    Io,
}

/// Generic Result Type for engine operations
pub type Result<T> = core::result::Result<T, Error>;

/// Unified engine error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Input ended before the structure was complete
    #[error("unexpected end of input")]
    UnexpectedEnd,

    /// Output buffer cannot hold the encoding
    #[error("buffer too small")]
    BufferTooSmall,

    /// Varint value above 2^62-1
    #[error("value {0} does not fit a variable-length integer")]
    VarIntOutOfRange(u64),

    /// Packet header could not be parsed
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// A frame body could not be parsed
    #[error("malformed frame 0x{frame_type:02x}: {reason}")]
    MalformedFrame {
        frame_type: u8,
        reason: &'static str,
    },

    /// Frame type byte outside the catalog
    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u64),

    /// Keys for this level are not installed yet
    #[error("keys unavailable for {0:?}")]
    KeysUnavailable(EncryptionLevel),

    /// AEAD open failed with installed keys
    #[error("packet decryption failed")]
    DecryptionFailed,

    /// Error reported by the crypto collaborator
    #[error("crypto collaborator error: {0}")]
    Crypto(String),

    /// Version negotiation found no common version
    #[error("no appropriate version found")]
    NoAppropriateVersion,

    /// Version outside the supported set
    #[error("unsupported version 0x{0:08x}")]
    UnsupportedVersion(u32),

    /// Transport parameter could not be decoded
    #[error("invalid transport parameter")]
    InvalidTransportParameter,

    /// Connection already closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Lifecycle transition not allowed
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Stream id not usable for the requested operation
    #[error("invalid stream id {0}")]
    InvalidStreamId(u64),

    /// Operation not allowed in this stream direction
    #[error("stream {0} does not allow this direction")]
    StreamDirection(u64),

    /// Transport error raised locally
    #[error("transport error {0:?}")]
    Transport(TransportError),
}

impl Error {
    /// Category of this error (see module docs)
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::UnexpectedEnd
            | Error::BufferTooSmall
            | Error::VarIntOutOfRange(_)
            | Error::MalformedPacket(_)
            | Error::MalformedFrame { .. }
            | Error::UnknownFrameType(_) => ErrorCategory::Wire,
            Error::KeysUnavailable(_) | Error::DecryptionFailed | Error::Crypto(_) => {
                ErrorCategory::Crypto
            }
            Error::NoAppropriateVersion
            | Error::UnsupportedVersion(_)
            | Error::InvalidTransportParameter => ErrorCategory::Negotiation,
            Error::InvalidStreamId(_) | Error::StreamDirection(_) | Error::Transport(_) => {
                ErrorCategory::Protocol
            }
            Error::ConnectionClosed | Error::InvalidStateTransition { .. } => ErrorCategory::Io,
        }
    }

    /// Whether the packet should be kept for a later retry
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::KeysUnavailable(_))
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

/// Protocol violation detected while processing peer input
///
/// These are never silently dropped: the caller decides whether to close
/// the connection with [`ProtocolViolation::error_code`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Peer sent past the credit we advertised
    FlowControlExceeded { stream_id: Option<u64>, limit: u64, offset: u64 },

    /// Stream id invalid for its type, direction or beyond the limit
    InvalidStreamId { stream_id: u64 },

    /// A FIN at a different offset than the first one
    ConflictingFinalOffset { stream_id: u64, first: u64, conflicting: u64 },

    /// Data received beyond the final offset
    DataPastFinalOffset { stream_id: u64, final_offset: u64, end: u64 },

    /// Frame not allowed for the stream's direction
    StreamDirection { stream_id: u64, frame: &'static str },

    /// CRYPTO data too far ahead of what was delivered
    CryptoBufferExceeded { limit: u64, offset: u64 },
}

impl ProtocolViolation {
    /// Transport error to close the connection with
    pub fn error_code(&self) -> TransportError {
        match self {
            ProtocolViolation::FlowControlExceeded { .. } => TransportError::FlowControlError,
            ProtocolViolation::InvalidStreamId { .. } => TransportError::StreamIdError,
            ProtocolViolation::ConflictingFinalOffset { .. }
            | ProtocolViolation::DataPastFinalOffset { .. } => TransportError::FinalOffsetError,
            ProtocolViolation::StreamDirection { .. }
            | ProtocolViolation::CryptoBufferExceeded { .. } => TransportError::ProtocolViolation,
        }
    }
}
