//! Outbound stream bytes waiting to be framed.
//!
//! Each stream's queued bytes remember the offset of their first byte. When
//! a packet has room, every stream contributes at most one STREAM frame; the
//! FIN bit is set on the frame that drains a buffer whose stream was closed.

#![forbid(unsafe_code)]

use crate::frames::StreamFrame;
use crate::types::StreamId;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
struct SendBuffer {
    /// Stream offset of `data[0]`
    offset: u64,
    data: BytesMut,
    closing: bool,
}

/// Per-stream queues of unsent bytes
#[derive(Debug, Clone, Default)]
pub struct SendBuffers {
    buffers: BTreeMap<StreamId, SendBuffer>,
}

impl SendBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `data` starting at stream offset `offset`
    pub fn push(&mut self, stream_id: StreamId, offset: u64, data: &[u8], close: bool) {
        let buffer = self.buffers.entry(stream_id).or_insert_with(|| SendBuffer {
            offset,
            ..Default::default()
        });
        if buffer.data.is_empty() {
            buffer.offset = offset;
        }
        buffer.data.extend_from_slice(data);
        buffer.closing |= close;
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Bytes queued on one stream
    pub fn pending(&self, stream_id: StreamId) -> usize {
        self.buffers.get(&stream_id).map_or(0, |b| b.data.len())
    }

    /// Drop everything queued on one stream; returns the bytes dropped
    pub fn discard(&mut self, stream_id: StreamId) -> usize {
        self.buffers
            .remove(&stream_id)
            .map_or(0, |b| b.data.len())
    }

    /// Build STREAM frames fitting in `available` bytes
    pub fn next_frames(&mut self, mut available: usize) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        let mut drained = Vec::new();

        for (stream_id, buffer) in self.buffers.iter_mut() {
            let overhead = StreamFrame::overhead(*stream_id, buffer.offset, buffer.data.len());
            let length = (buffer.data.len() + overhead).min(available);
            let fin_only = buffer.data.is_empty() && buffer.closing && overhead <= available;
            if length <= overhead && !fin_only {
                continue;
            }
            let data: Bytes = buffer.data.split_to(length - overhead).freeze();
            let drains = buffer.data.is_empty();
            let frame = StreamFrame {
                stream_id: *stream_id,
                offset: buffer.offset,
                fin: drains && buffer.closing,
                data,
            };
            buffer.offset = frame.end();
            available -= frame_len(&frame).min(available);
            if drains {
                drained.push(*stream_id);
            }
            frames.push(frame);
        }
        for stream_id in drained {
            self.buffers.remove(&stream_id);
        }
        frames
    }
}

fn frame_len(frame: &StreamFrame) -> usize {
    StreamFrame::overhead(frame.stream_id, frame.offset, frame.data.len()) + frame.data.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame_drains_and_sets_fin() {
        let mut buffers = SendBuffers::new();
        buffers.push(StreamId(0), 0, b"GET /index.html\r\n", true);
        let frames = buffers.next_frames(1200);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].offset, 0);
        assert!(frames[0].fin);
        assert_eq!(&frames[0].data[..], b"GET /index.html\r\n");
        assert!(buffers.is_empty());
    }

    #[test]
    fn test_split_across_budgets_keeps_offsets() {
        let mut buffers = SendBuffers::new();
        buffers.push(StreamId(4), 100, &[7u8; 50], true);

        // type + stream id (1) + offset 100 (2) + length (1) = 5
        let first = buffers.next_frames(25);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].data.len(), 20);
        assert!(!first[0].fin);
        assert_eq!(buffers.pending(StreamId(4)), 30);

        let second = buffers.next_frames(1200);
        assert_eq!(second[0].offset, 120);
        assert_eq!(second[0].data.len(), 30);
        assert!(second[0].fin);
    }

    #[test]
    fn test_close_without_data_sends_fin() {
        let mut buffers = SendBuffers::new();
        buffers.push(StreamId(8), 42, b"", true);
        let frames = buffers.next_frames(100);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].fin);
        assert!(frames[0].data.is_empty());
        assert_eq!(frames[0].offset, 42);
        assert!(buffers.is_empty());
    }

    #[test]
    fn test_discard_drops_stream() {
        let mut buffers = SendBuffers::new();
        buffers.push(StreamId(0), 0, b"abc", false);
        buffers.push(StreamId(4), 0, b"de", true);
        assert_eq!(buffers.discard(StreamId(0)), 3);
        assert_eq!(buffers.discard(StreamId(0)), 0);
        let frames = buffers.next_frames(100);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id, StreamId(4));
    }

    #[test]
    fn test_budget_too_small_produces_nothing() {
        let mut buffers = SendBuffers::new();
        buffers.push(StreamId(0), 0, b"data", false);
        assert!(buffers.next_frames(3).is_empty());
        assert_eq!(buffers.pending(StreamId(0)), 4);
    }

    #[test]
    fn test_one_frame_per_stream_within_budget() {
        let mut buffers = SendBuffers::new();
        buffers.push(StreamId(0), 0, &[1u8; 10], false);
        buffers.push(StreamId(4), 0, &[2u8; 10], false);
        let frames = buffers.next_frames(20);
        // First stream fits entirely (3 + 10), the second gets what is left
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data.len(), 10);
        assert_eq!(frames[1].data.len(), 4);
    }
}
