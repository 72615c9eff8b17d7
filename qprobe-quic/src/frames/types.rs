//! # Frame Catalog
//!
//! Every frame this endpoint understands, as one closed enum. Each variant
//! knows its wire type, encoded length, whether it is worth resending after
//! loss and where it ranks when packets are assembled.
//!
//! ## Frame Classification:
//! - **ACK-eliciting**: everything except ACK, PADDING and the close frames
//! - **Retransmittable**: control and data frames; ACK, PADDING, close
//!   frames and PATH_RESPONSE are never resent as-is

#![forbid(unsafe_code)]

use super::ack::AckFrame;
use crate::error::Result;
use crate::types::{ConnectionId, StreamId, VarIntCodec};
use bytes::{BufMut, Bytes, BytesMut};

/// Frame Type Constants
pub const FRAME_TYPE_PADDING: u8 = 0x00;
pub const FRAME_TYPE_RESET_STREAM: u8 = 0x01;
pub const FRAME_TYPE_CONNECTION_CLOSE: u8 = 0x02;
pub const FRAME_TYPE_APPLICATION_CLOSE: u8 = 0x03;
pub const FRAME_TYPE_MAX_DATA: u8 = 0x04;
pub const FRAME_TYPE_MAX_STREAM_DATA: u8 = 0x05;
pub const FRAME_TYPE_MAX_STREAM_ID: u8 = 0x06;
pub const FRAME_TYPE_PING: u8 = 0x07;
pub const FRAME_TYPE_DATA_BLOCKED: u8 = 0x08;
pub const FRAME_TYPE_STREAM_DATA_BLOCKED: u8 = 0x09;
pub const FRAME_TYPE_STREAM_ID_BLOCKED: u8 = 0x0a;
pub const FRAME_TYPE_NEW_CONNECTION_ID: u8 = 0x0b;
pub const FRAME_TYPE_STOP_SENDING: u8 = 0x0c;
pub const FRAME_TYPE_RETIRE_CONNECTION_ID: u8 = 0x0d;
pub const FRAME_TYPE_PATH_CHALLENGE: u8 = 0x0e;
pub const FRAME_TYPE_PATH_RESPONSE: u8 = 0x0f;
pub const FRAME_TYPE_STREAM: u8 = 0x10; // 0x10-0x17
pub const FRAME_TYPE_CRYPTO: u8 = 0x18;
pub const FRAME_TYPE_NEW_TOKEN: u8 = 0x19;
pub const FRAME_TYPE_ACK: u8 = 0x1a;
pub const FRAME_TYPE_ACK_ECN: u8 = 0x1b;

/// STREAM Frame Flag Bits (low 3 bits of the type byte)
pub const STREAM_FRAME_BIT_FIN: u8 = 0x01;
pub const STREAM_FRAME_BIT_LEN: u8 = 0x02;
pub const STREAM_FRAME_BIT_OFF: u8 = 0x04;

/// Length of a stateless reset token
pub const RESET_TOKEN_LEN: usize = 16;

/// RESET_STREAM Frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStreamFrame {
    pub stream_id: StreamId,
    pub error_code: u16,
    pub final_offset: u64,
}

/// CONNECTION_CLOSE Frame (transport error)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    pub error_code: u16,
    /// Type of the frame that triggered the error, 0 if unknown
    pub frame_type: u64,
    pub reason: Bytes,
}

/// APPLICATION_CLOSE Frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationCloseFrame {
    pub error_code: u16,
    pub reason: Bytes,
}

/// MAX_STREAM_DATA Frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamDataFrame {
    pub stream_id: StreamId,
    pub maximum_stream_data: u64,
}

/// STREAM_DATA_BLOCKED Frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataBlockedFrame {
    pub stream_id: StreamId,
    pub offset: u64,
}

/// NEW_CONNECTION_ID Frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionIdFrame {
    pub sequence: u64,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: [u8; RESET_TOKEN_LEN],
}

/// STOP_SENDING Frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSendingFrame {
    pub stream_id: StreamId,
    pub error_code: u16,
}

/// STREAM Frame
///
/// Always encoded with an explicit length; the offset is omitted when zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

impl StreamFrame {
    /// Offset one past the last byte of this frame
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    /// Encoded length for a frame with `data_len` payload bytes
    pub fn overhead(stream_id: StreamId, offset: u64, data_len: usize) -> usize {
        let off = if offset > 0 {
            VarIntCodec::size(offset)
        } else {
            0
        };
        1 + VarIntCodec::size(stream_id.value()) + off + VarIntCodec::size(data_len as u64)
    }
}

/// CRYPTO Frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame {
    pub offset: u64,
    pub data: Bytes,
}

impl CryptoFrame {
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    /// Encoded length without the payload
    pub fn overhead(offset: u64, data_len: usize) -> usize {
        1 + VarIntCodec::size(offset) + VarIntCodec::size(data_len as u64)
    }
}

/// A frame carried in a packet payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Run of consecutive PADDING bytes
    Padding(usize),
    ResetStream(ResetStreamFrame),
    ConnectionClose(ConnectionCloseFrame),
    ApplicationClose(ApplicationCloseFrame),
    MaxData(u64),
    MaxStreamData(MaxStreamDataFrame),
    /// Highest stream id the peer may open; its low bits give the direction
    MaxStreamId(StreamId),
    Ping,
    DataBlocked(u64),
    StreamDataBlocked(StreamDataBlockedFrame),
    StreamIdBlocked(StreamId),
    NewConnectionId(NewConnectionIdFrame),
    StopSending(StopSendingFrame),
    RetireConnectionId(u64),
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    Stream(StreamFrame),
    Crypto(CryptoFrame),
    NewToken(Bytes),
    /// ACK or ACK_ECN, depending on `ecn`
    Ack(AckFrame),
}

impl Frame {
    /// Wire type byte
    pub fn frame_type(&self) -> u8 {
        match self {
            Frame::Padding(_) => FRAME_TYPE_PADDING,
            Frame::ResetStream(_) => FRAME_TYPE_RESET_STREAM,
            Frame::ConnectionClose(_) => FRAME_TYPE_CONNECTION_CLOSE,
            Frame::ApplicationClose(_) => FRAME_TYPE_APPLICATION_CLOSE,
            Frame::MaxData(_) => FRAME_TYPE_MAX_DATA,
            Frame::MaxStreamData(_) => FRAME_TYPE_MAX_STREAM_DATA,
            Frame::MaxStreamId(_) => FRAME_TYPE_MAX_STREAM_ID,
            Frame::Ping => FRAME_TYPE_PING,
            Frame::DataBlocked(_) => FRAME_TYPE_DATA_BLOCKED,
            Frame::StreamDataBlocked(_) => FRAME_TYPE_STREAM_DATA_BLOCKED,
            Frame::StreamIdBlocked(_) => FRAME_TYPE_STREAM_ID_BLOCKED,
            Frame::NewConnectionId(_) => FRAME_TYPE_NEW_CONNECTION_ID,
            Frame::StopSending(_) => FRAME_TYPE_STOP_SENDING,
            Frame::RetireConnectionId(_) => FRAME_TYPE_RETIRE_CONNECTION_ID,
            Frame::PathChallenge(_) => FRAME_TYPE_PATH_CHALLENGE,
            Frame::PathResponse(_) => FRAME_TYPE_PATH_RESPONSE,
            Frame::Stream(f) => {
                let mut t = FRAME_TYPE_STREAM | STREAM_FRAME_BIT_LEN;
                if f.offset > 0 {
                    t |= STREAM_FRAME_BIT_OFF;
                }
                if f.fin {
                    t |= STREAM_FRAME_BIT_FIN;
                }
                t
            }
            Frame::Crypto(_) => FRAME_TYPE_CRYPTO,
            Frame::NewToken(_) => FRAME_TYPE_NEW_TOKEN,
            Frame::Ack(ack) => ack.frame_type(),
        }
    }

    /// Scheduling priority, lower is sent first
    pub fn priority(&self) -> u8 {
        match self {
            Frame::ConnectionClose(_) => 1,
            Frame::ApplicationClose(_) => 2,
            Frame::PathResponse(_) => 3,
            Frame::Ack(ack) if ack.ecn.is_none() => 4,
            Frame::Ack(_) => 5,
            Frame::Crypto(_) => 6,
            Frame::Ping => 7,
            Frame::NewConnectionId(_) => 8,
            Frame::RetireConnectionId(_) => 9,
            Frame::PathChallenge(_) => 10,
            Frame::ResetStream(_) => 11,
            Frame::StopSending(_) => 12,
            Frame::MaxData(_) => 13,
            Frame::MaxStreamData(_) => 14,
            Frame::MaxStreamId(id) if id.is_bidirectional() => 15,
            Frame::MaxStreamId(_) => 16,
            Frame::DataBlocked(_) => 17,
            Frame::StreamDataBlocked(_) => 18,
            Frame::StreamIdBlocked(id) if id.is_bidirectional() => 19,
            Frame::StreamIdBlocked(_) => 20,
            Frame::NewToken(_) => 21,
            Frame::Stream(_) => 22,
            Frame::Padding(_) => 23,
        }
    }

    /// Whether a lost copy of this frame should be sent again
    pub fn is_retransmittable(&self) -> bool {
        !matches!(
            self,
            Frame::Padding(_)
                | Frame::ConnectionClose(_)
                | Frame::ApplicationClose(_)
                | Frame::Ack(_)
                | Frame::PathResponse(_)
        )
    }

    /// Whether receiving this frame obliges the receiver to acknowledge
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding(_) | Frame::Ack(_) | Frame::ConnectionClose(_) | Frame::ApplicationClose(_)
        )
    }

    /// Encoded length in bytes
    pub fn wire_len(&self) -> usize {
        let v = |x: u64| VarIntCodec::size(x);
        match self {
            Frame::Padding(n) => (*n).max(1),
            Frame::ResetStream(f) => 1 + v(f.stream_id.value()) + 2 + v(f.final_offset),
            Frame::ConnectionClose(f) => {
                1 + 2 + v(f.frame_type) + v(f.reason.len() as u64) + f.reason.len()
            }
            Frame::ApplicationClose(f) => 1 + 2 + v(f.reason.len() as u64) + f.reason.len(),
            Frame::MaxData(m) => 1 + v(*m),
            Frame::MaxStreamData(f) => 1 + v(f.stream_id.value()) + v(f.maximum_stream_data),
            Frame::MaxStreamId(id) => 1 + v(id.value()),
            Frame::Ping => 1,
            Frame::DataBlocked(o) => 1 + v(*o),
            Frame::StreamDataBlocked(f) => 1 + v(f.stream_id.value()) + v(f.offset),
            Frame::StreamIdBlocked(id) => 1 + v(id.value()),
            Frame::NewConnectionId(f) => {
                1 + v(f.sequence) + 1 + f.connection_id.len() + RESET_TOKEN_LEN
            }
            Frame::StopSending(f) => 1 + v(f.stream_id.value()) + 2,
            Frame::RetireConnectionId(s) => 1 + v(*s),
            Frame::PathChallenge(_) | Frame::PathResponse(_) => 1 + 8,
            Frame::Stream(f) => StreamFrame::overhead(f.stream_id, f.offset, f.data.len()) + f.data.len(),
            Frame::Crypto(f) => CryptoFrame::overhead(f.offset, f.data.len()) + f.data.len(),
            Frame::NewToken(t) => 1 + v(t.len() as u64) + t.len(),
            Frame::Ack(a) => {
                let mut n = 1
                    + v(a.largest_acknowledged)
                    + v(a.ack_delay)
                    + v(a.blocks.len() as u64)
                    + v(a.first_block);
                for b in &a.blocks {
                    n += v(b.gap) + v(b.block);
                }
                if let Some(ecn) = &a.ecn {
                    n += v(ecn.ect0) + v(ecn.ect1) + v(ecn.ce);
                }
                n
            }
        }
    }

    /// Append the wire encoding of this frame
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let put = VarIntCodec::put;
        buf.put_u8(self.frame_type());
        match self {
            Frame::Padding(n) => {
                // Type byte already written
                buf.put_bytes(0, n.saturating_sub(1));
            }
            Frame::ResetStream(f) => {
                put(f.stream_id.value(), buf)?;
                buf.put_u16(f.error_code);
                put(f.final_offset, buf)?;
            }
            Frame::ConnectionClose(f) => {
                buf.put_u16(f.error_code);
                put(f.frame_type, buf)?;
                put(f.reason.len() as u64, buf)?;
                buf.put_slice(&f.reason);
            }
            Frame::ApplicationClose(f) => {
                buf.put_u16(f.error_code);
                put(f.reason.len() as u64, buf)?;
                buf.put_slice(&f.reason);
            }
            Frame::MaxData(m) | Frame::DataBlocked(m) | Frame::RetireConnectionId(m) => {
                put(*m, buf)?;
            }
            Frame::MaxStreamData(f) => {
                put(f.stream_id.value(), buf)?;
                put(f.maximum_stream_data, buf)?;
            }
            Frame::MaxStreamId(id) | Frame::StreamIdBlocked(id) => put(id.value(), buf)?,
            Frame::Ping => {}
            Frame::StreamDataBlocked(f) => {
                put(f.stream_id.value(), buf)?;
                put(f.offset, buf)?;
            }
            Frame::NewConnectionId(f) => {
                put(f.sequence, buf)?;
                buf.put_u8(f.connection_id.len() as u8);
                buf.put_slice(f.connection_id.as_bytes());
                buf.put_slice(&f.stateless_reset_token);
            }
            Frame::StopSending(f) => {
                put(f.stream_id.value(), buf)?;
                buf.put_u16(f.error_code);
            }
            Frame::PathChallenge(d) | Frame::PathResponse(d) => buf.put_slice(d),
            Frame::Stream(f) => {
                put(f.stream_id.value(), buf)?;
                if f.offset > 0 {
                    put(f.offset, buf)?;
                }
                put(f.data.len() as u64, buf)?;
                buf.put_slice(&f.data);
            }
            Frame::Crypto(f) => {
                put(f.offset, buf)?;
                put(f.data.len() as u64, buf)?;
                buf.put_slice(&f.data);
            }
            Frame::NewToken(t) => {
                put(t.len() as u64, buf)?;
                buf.put_slice(t);
            }
            Frame::Ack(a) => {
                put(a.largest_acknowledged, buf)?;
                put(a.ack_delay, buf)?;
                put(a.blocks.len() as u64, buf)?;
                put(a.first_block, buf)?;
                for b in &a.blocks {
                    put(b.gap, buf)?;
                    put(b.block, buf)?;
                }
                if let Some(ecn) = &a.ecn {
                    put(ecn.ect0, buf)?;
                    put(ecn.ect1, buf)?;
                    put(ecn.ce, buf)?;
                }
            }
        }
        Ok(())
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Padding(_) => "PADDING",
            Frame::ResetStream(_) => "RESET_STREAM",
            Frame::ConnectionClose(_) => "CONNECTION_CLOSE",
            Frame::ApplicationClose(_) => "APPLICATION_CLOSE",
            Frame::MaxData(_) => "MAX_DATA",
            Frame::MaxStreamData(_) => "MAX_STREAM_DATA",
            Frame::MaxStreamId(_) => "MAX_STREAM_ID",
            Frame::Ping => "PING",
            Frame::DataBlocked(_) => "DATA_BLOCKED",
            Frame::StreamDataBlocked(_) => "STREAM_DATA_BLOCKED",
            Frame::StreamIdBlocked(_) => "STREAM_ID_BLOCKED",
            Frame::NewConnectionId(_) => "NEW_CONNECTION_ID",
            Frame::StopSending(_) => "STOP_SENDING",
            Frame::RetireConnectionId(_) => "RETIRE_CONNECTION_ID",
            Frame::PathChallenge(_) => "PATH_CHALLENGE",
            Frame::PathResponse(_) => "PATH_RESPONSE",
            Frame::Stream(_) => "STREAM",
            Frame::Crypto(_) => "CRYPTO",
            Frame::NewToken(_) => "NEW_TOKEN",
            Frame::Ack(_) => "ACK",
        }
    }
}

/// Encode a list of frames into one payload
pub fn encode_frames(frames: &[Frame]) -> Result<BytesMut> {
    let len = frames.iter().map(Frame::wire_len).sum();
    let mut buf = BytesMut::with_capacity(len);
    for frame in frames {
        frame.encode(&mut buf)?;
    }
    Ok(buf)
}
