//! # Streams
//!
//! Per-stream receive reassembly and send offsets, the [`Streams`] registry
//! that owns them, and one crypto stream per packet number space.
//!
//! Streams are created lazily on first access and live as long as the
//! connection. Outbound bytes waiting to be framed are held by
//! [`SendBuffers`], next to whoever produces STREAM frames.

#![forbid(unsafe_code)]

pub mod reassembly;
pub mod send;

pub use reassembly::{FinalOffsetAnomaly, Gaps, Insertion, ReassemblyBuffer};
pub use send::SendBuffers;

use crate::error::{Error, ProtocolViolation, Result};
use crate::frames::{Frame, ResetStreamFrame, StopSendingFrame, StreamFrame};
use crate::types::{PacketNumberSpace, Side, StreamId, StreamType};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Receive data accepted ahead of a stream's read offset
pub const STREAM_REASSEMBLY_WINDOW: u64 = 16 * 1024 * 1024;

/// Handshake data accepted ahead of a crypto stream's read offset
pub const CRYPTO_BUFFER_LIMIT: u64 = 64 * 1024;

/// Result of feeding one STREAM frame to a stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRead {
    /// Newly contiguous bytes
    pub delivered: Option<Bytes>,
    /// The read side reached its final offset with this frame
    pub finished: bool,
    /// Retransmission of bytes already received
    pub duplicate: bool,
    pub violation: Option<ProtocolViolation>,
}

/// One stream's state
#[derive(Debug, Clone)]
pub struct Stream {
    id: StreamId,
    recv: ReassemblyBuffer,

    /// Receive credit granted to the peer, unset until flow control knows it
    pub(crate) read_limit: Option<u64>,
    /// Send credit granted by the peer, unset until flow control knows it
    pub(crate) write_limit: Option<u64>,
    /// Credit already reserved for queued data
    pub(crate) write_reserved: u64,

    write_offset: u64,
    write_closed: bool,
    write_close_offset: Option<u64>,
    stop_sending_sent: bool,
}

impl Stream {
    pub fn new(id: StreamId) -> Self {
        Self {
            id,
            recv: ReassemblyBuffer::with_window(STREAM_REASSEMBLY_WINDOW),
            read_limit: None,
            write_limit: None,
            write_reserved: 0,
            write_offset: 0,
            write_closed: false,
            write_close_offset: None,
            stop_sending_sent: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn read_offset(&self) -> u64 {
        self.recv.read_offset()
    }

    /// Highest offset received so far, delivered or not
    pub fn max_read_received(&self) -> u64 {
        self.recv.max_read_received()
    }

    pub fn read_closed(&self) -> bool {
        self.recv.is_finished()
    }

    pub fn read_close_offset(&self) -> Option<u64> {
        self.recv.final_offset()
    }

    pub fn read_limit(&self) -> Option<u64> {
        self.read_limit
    }

    pub fn write_limit(&self) -> Option<u64> {
        self.write_limit
    }

    pub fn write_reserved(&self) -> u64 {
        self.write_reserved
    }

    /// Bytes queued for sending so far
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    pub fn write_closed(&self) -> bool {
        self.write_closed
    }

    pub fn write_close_offset(&self) -> Option<u64> {
        self.write_close_offset
    }

    /// Feed a received STREAM frame
    ///
    /// Frames on a send-only stream, past the receive credit or in conflict
    /// with the final offset come back with a violation.
    pub fn add_to_read(&mut self, frame: &StreamFrame, side: Side) -> StreamRead {
        let stream_id = self.id.value();
        if !self.id.can_receive(side) {
            return StreamRead {
                violation: Some(ProtocolViolation::StreamDirection {
                    stream_id,
                    frame: "STREAM",
                }),
                ..Default::default()
            };
        }
        if let Some(limit) = self.read_limit {
            if frame.end() > limit {
                return StreamRead {
                    violation: Some(ProtocolViolation::FlowControlExceeded {
                        stream_id: Some(stream_id),
                        limit,
                        offset: frame.end(),
                    }),
                    ..Default::default()
                };
            }
        }

        let insertion = self.recv.insert(frame.offset, &frame.data, frame.fin);
        if let Some(limit) = insertion.window_exceeded {
            return StreamRead {
                violation: Some(ProtocolViolation::FlowControlExceeded {
                    stream_id: Some(stream_id),
                    limit,
                    offset: frame.end(),
                }),
                ..Default::default()
            };
        }
        let violation = insertion.anomaly.map(|anomaly| match anomaly {
            FinalOffsetAnomaly::Conflicting { first, conflicting } => {
                ProtocolViolation::ConflictingFinalOffset {
                    stream_id,
                    first,
                    conflicting,
                }
            }
            FinalOffsetAnomaly::DataPast { final_offset, end } => {
                ProtocolViolation::DataPastFinalOffset {
                    stream_id,
                    final_offset,
                    end,
                }
            }
        });
        StreamRead {
            delivered: insertion.delivered,
            finished: insertion.finished,
            duplicate: insertion.duplicate,
            violation,
        }
    }

    /// Account for `len` bytes queued by the application
    ///
    /// Returns the offset of the first queued byte.
    pub fn on_write(&mut self, len: usize, close: bool, side: Side) -> Result<u64> {
        if !self.id.can_send(side) {
            return Err(Error::StreamDirection(self.id.value()));
        }
        if self.write_closed {
            return Err(Error::InvalidStreamId(self.id.value()));
        }
        let offset = self.write_offset;
        self.write_offset += len as u64;
        if close {
            self.write_closed = true;
            self.write_close_offset = Some(self.write_offset);
        }
        Ok(offset)
    }

    /// Close the send side, returning the FIN frame to send
    pub fn close(&mut self, side: Side) -> Result<Frame> {
        if !self.id.can_send(side) {
            return Err(Error::StreamDirection(self.id.value()));
        }
        if self.write_closed {
            return Err(Error::InvalidStreamId(self.id.value()));
        }
        self.write_closed = true;
        self.write_close_offset = Some(self.write_offset);
        Ok(Frame::Stream(StreamFrame {
            stream_id: self.id,
            offset: self.write_offset,
            fin: true,
            data: Bytes::new(),
        }))
    }

    /// Abandon the send side with RESET_STREAM
    pub fn reset(&mut self, error_code: u16, side: Side) -> Result<Frame> {
        if !self.id.can_send(side) {
            return Err(Error::StreamDirection(self.id.value()));
        }
        if self.write_closed {
            return Err(Error::InvalidStreamId(self.id.value()));
        }
        self.write_closed = true;
        self.write_close_offset = Some(self.write_offset);
        Ok(Frame::ResetStream(ResetStreamFrame {
            stream_id: self.id,
            error_code,
            final_offset: self.write_offset,
        }))
    }

    /// Ask the peer to stop sending with STOP_SENDING
    pub fn stop_sending(&mut self, error_code: u16, side: Side) -> Result<Frame> {
        if !self.id.can_receive(side) {
            return Err(Error::StreamDirection(self.id.value()));
        }
        self.stop_sending_sent = true;
        Ok(Frame::StopSending(StopSendingFrame {
            stream_id: self.id,
            error_code,
        }))
    }

    pub fn stop_sending_sent(&self) -> bool {
        self.stop_sending_sent
    }
}

/// Registry owning every stream of a connection by value
#[derive(Debug, Clone)]
pub struct Streams {
    side: Side,
    streams: BTreeMap<StreamId, Stream>,
}

impl Streams {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            streams: BTreeMap::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// The stream with this id, created on first access
    pub fn get_or_create(&mut self, id: StreamId) -> &mut Stream {
        self.streams.entry(id).or_insert_with(|| Stream::new(id))
    }

    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Streams the peer has opened so far
    pub fn peer_streams_open(&self) -> usize {
        self.streams
            .keys()
            .filter(|id| !id.is_local(self.side))
            .count()
    }

    /// Lowest locally initiated stream id of the given direction not yet in use
    pub fn next_available_stream_id(&self, bidirectional: bool) -> StreamId {
        let stream_type = StreamType::new(self.side, bidirectional);
        let mut n = 0;
        loop {
            let id = stream_type.nth(n);
            if !self.streams.contains_key(&id) {
                return id;
            }
            n += 1;
        }
    }

    /// Drop every stream
    pub fn clear(&mut self) {
        self.streams.clear();
    }
}

/// Handshake byte stream of one packet number space
#[derive(Debug, Clone)]
pub struct CryptoStream {
    pub recv: ReassemblyBuffer,
    /// Bytes of handshake data sent so far
    pub write_offset: u64,
}

impl Default for CryptoStream {
    fn default() -> Self {
        Self {
            recv: ReassemblyBuffer::with_window(CRYPTO_BUFFER_LIMIT),
            write_offset: 0,
        }
    }
}

impl CryptoStream {
    /// Offset for `len` new outbound bytes
    pub fn reserve_write(&mut self, len: usize) -> u64 {
        let offset = self.write_offset;
        self.write_offset += len as u64;
        offset
    }
}

/// One crypto stream per packet number space
#[derive(Debug, Clone, Default)]
pub struct CryptoStreams {
    spaces: [CryptoStream; 3],
}

impl CryptoStreams {
    pub fn get(&self, space: PacketNumberSpace) -> Option<&CryptoStream> {
        space.index().map(|i| &self.spaces[i])
    }

    pub fn get_mut(&mut self, space: PacketNumberSpace) -> Option<&mut CryptoStream> {
        space.index().map(move |i| &mut self.spaces[i])
    }

    pub fn clear(&mut self) {
        self.spaces = Default::default();
    }
}
