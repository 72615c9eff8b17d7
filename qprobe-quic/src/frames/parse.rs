//! # Frame Parsing
//!
//! Frames are decoded from a shared `Bytes` payload so STREAM, CRYPTO and
//! token bodies are sliced, not copied. [`FrameIterator`] walks a payload
//! and stops at the first malformed frame.

#![forbid(unsafe_code)]

use super::ack::{AckBlock, AckFrame, EcnCounts};
use super::types::*;
use crate::error::{Error, Result};
use crate::types::{ConnectionId, Cursor, StreamId, MAX_CID_LENGTH};
use bytes::Bytes;
use tinyvec::TinyVec;

/// Decode one frame at `offset` in `payload`
///
/// Returns the frame and the number of bytes it occupied.
pub fn decode_frame(payload: &Bytes, offset: usize) -> Result<(Frame, usize)> {
    let buf = payload.get(offset..).ok_or(Error::UnexpectedEnd)?;
    let mut c = Cursor::new(buf);
    let frame_type = c.read_varint()?;
    let ty = u8::try_from(frame_type).map_err(|_| Error::UnknownFrameType(frame_type))?;
    let malformed = |reason: &'static str| Error::MalformedFrame {
        frame_type: ty,
        reason,
    };
    // Slice of the payload between two cursor positions
    let slice = |start: usize, len: usize| payload.slice(offset + start..offset + start + len);

    let frame = match ty {
        FRAME_TYPE_PADDING => {
            let mut n = 1;
            while c.peek_u8().ok() == Some(0) {
                c.read_u8()?;
                n += 1;
            }
            Frame::Padding(n)
        }
        FRAME_TYPE_RESET_STREAM => Frame::ResetStream(ResetStreamFrame {
            stream_id: StreamId(c.read_varint()?),
            error_code: c.read_u16()?,
            final_offset: c.read_varint()?,
        }),
        FRAME_TYPE_CONNECTION_CLOSE => {
            let error_code = c.read_u16()?;
            let frame_type = c.read_varint()?;
            let reason = c.read_varint_prefixed()?;
            let start = c.position() - reason.len();
            Frame::ConnectionClose(ConnectionCloseFrame {
                error_code,
                frame_type,
                reason: slice(start, reason.len()),
            })
        }
        FRAME_TYPE_APPLICATION_CLOSE => {
            let error_code = c.read_u16()?;
            let reason = c.read_varint_prefixed()?;
            let start = c.position() - reason.len();
            Frame::ApplicationClose(ApplicationCloseFrame {
                error_code,
                reason: slice(start, reason.len()),
            })
        }
        FRAME_TYPE_MAX_DATA => Frame::MaxData(c.read_varint()?),
        FRAME_TYPE_MAX_STREAM_DATA => Frame::MaxStreamData(MaxStreamDataFrame {
            stream_id: StreamId(c.read_varint()?),
            maximum_stream_data: c.read_varint()?,
        }),
        FRAME_TYPE_MAX_STREAM_ID => Frame::MaxStreamId(StreamId(c.read_varint()?)),
        FRAME_TYPE_PING => Frame::Ping,
        FRAME_TYPE_DATA_BLOCKED => Frame::DataBlocked(c.read_varint()?),
        FRAME_TYPE_STREAM_DATA_BLOCKED => Frame::StreamDataBlocked(StreamDataBlockedFrame {
            stream_id: StreamId(c.read_varint()?),
            offset: c.read_varint()?,
        }),
        FRAME_TYPE_STREAM_ID_BLOCKED => Frame::StreamIdBlocked(StreamId(c.read_varint()?)),
        FRAME_TYPE_NEW_CONNECTION_ID => {
            let sequence = c.read_varint()?;
            let len = c.read_u8()? as usize;
            if len > MAX_CID_LENGTH {
                return Err(malformed("connection id too long"));
            }
            let connection_id = ConnectionId::from_slice(c.read_bytes(len)?)
                .ok_or_else(|| malformed("connection id too long"))?;
            Frame::NewConnectionId(NewConnectionIdFrame {
                sequence,
                connection_id,
                stateless_reset_token: c.read_array()?,
            })
        }
        FRAME_TYPE_STOP_SENDING => Frame::StopSending(StopSendingFrame {
            stream_id: StreamId(c.read_varint()?),
            error_code: c.read_u16()?,
        }),
        FRAME_TYPE_RETIRE_CONNECTION_ID => Frame::RetireConnectionId(c.read_varint()?),
        FRAME_TYPE_PATH_CHALLENGE => Frame::PathChallenge(c.read_array()?),
        FRAME_TYPE_PATH_RESPONSE => Frame::PathResponse(c.read_array()?),
        t if t & !0x07 == FRAME_TYPE_STREAM => {
            let stream_id = StreamId(c.read_varint()?);
            let offset = if t & STREAM_FRAME_BIT_OFF != 0 {
                c.read_varint()?
            } else {
                0
            };
            let len = if t & STREAM_FRAME_BIT_LEN != 0 {
                usize::try_from(c.read_varint()?).map_err(|_| Error::UnexpectedEnd)?
            } else {
                c.remaining()
            };
            let start = c.position();
            c.read_bytes(len)?;
            let frame = StreamFrame {
                stream_id,
                offset,
                fin: t & STREAM_FRAME_BIT_FIN != 0,
                data: slice(start, len),
            };
            if frame.end() > crate::types::VARINT_MAX {
                return Err(malformed("stream data beyond maximum offset"));
            }
            Frame::Stream(frame)
        }
        FRAME_TYPE_CRYPTO => {
            let crypto_offset = c.read_varint()?;
            let data = c.read_varint_prefixed()?;
            let start = c.position() - data.len();
            Frame::Crypto(CryptoFrame {
                offset: crypto_offset,
                data: slice(start, data.len()),
            })
        }
        FRAME_TYPE_NEW_TOKEN => {
            let token = c.read_varint_prefixed()?;
            if token.is_empty() {
                return Err(malformed("empty token"));
            }
            let start = c.position() - token.len();
            Frame::NewToken(slice(start, token.len()))
        }
        FRAME_TYPE_ACK | FRAME_TYPE_ACK_ECN => {
            let largest_acknowledged = c.read_varint()?;
            let ack_delay = c.read_varint()?;
            let block_count = c.read_varint()?;
            let first_block = c.read_varint()?;
            // Each block takes at least two bytes
            if block_count > (c.remaining() / 2) as u64 {
                return Err(malformed("ack block count exceeds payload"));
            }
            let mut blocks = TinyVec::new();
            for _ in 0..block_count {
                blocks.push(AckBlock {
                    gap: c.read_varint()?,
                    block: c.read_varint()?,
                });
            }
            let ecn = if ty == FRAME_TYPE_ACK_ECN {
                Some(EcnCounts {
                    ect0: c.read_varint()?,
                    ect1: c.read_varint()?,
                    ce: c.read_varint()?,
                })
            } else {
                None
            };
            let ack = AckFrame {
                largest_acknowledged,
                ack_delay,
                first_block,
                blocks,
                ecn,
            };
            ack.acked_ranges()?;
            Frame::Ack(ack)
        }
        _ => return Err(Error::UnknownFrameType(frame_type)),
    };

    Ok((frame, c.position()))
}

/// Iterator over the frames of a decrypted payload
///
/// Yields an error once and then stops: nothing after a malformed frame
/// can be trusted.
pub struct FrameIterator {
    payload: Bytes,
    offset: usize,
}

impl FrameIterator {
    pub fn new(payload: Bytes) -> Self {
        Self { payload, offset: 0 }
    }
}

impl Iterator for FrameIterator {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.payload.len() {
            return None;
        }
        match decode_frame(&self.payload, self.offset) {
            Ok((frame, consumed)) => {
                self.offset += consumed;
                Some(Ok(frame))
            }
            Err(e) => {
                self.offset = self.payload.len();
                Some(Err(e))
            }
        }
    }
}

/// Decode every frame of a payload
pub fn decode_frames(payload: Bytes) -> Result<Vec<Frame>> {
    FrameIterator::new(payload).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), frame.wire_len(), "wire_len of {}", frame.name());
        let (decoded, consumed) = decode_frame(&buf.freeze(), 0).unwrap();
        assert_eq!(consumed, frame.wire_len());
        decoded
    }

    mod frame_type_constants {
        use super::*;

        #[test]
        fn test_frame_type_values() {
            assert_eq!(FRAME_TYPE_PADDING, 0x00);
            assert_eq!(FRAME_TYPE_RESET_STREAM, 0x01);
            assert_eq!(FRAME_TYPE_CONNECTION_CLOSE, 0x02);
            assert_eq!(FRAME_TYPE_APPLICATION_CLOSE, 0x03);
            assert_eq!(FRAME_TYPE_MAX_DATA, 0x04);
            assert_eq!(FRAME_TYPE_MAX_STREAM_DATA, 0x05);
            assert_eq!(FRAME_TYPE_MAX_STREAM_ID, 0x06);
            assert_eq!(FRAME_TYPE_PING, 0x07);
            assert_eq!(FRAME_TYPE_DATA_BLOCKED, 0x08);
            assert_eq!(FRAME_TYPE_STREAM_DATA_BLOCKED, 0x09);
            assert_eq!(FRAME_TYPE_STREAM_ID_BLOCKED, 0x0a);
            assert_eq!(FRAME_TYPE_NEW_CONNECTION_ID, 0x0b);
            assert_eq!(FRAME_TYPE_STOP_SENDING, 0x0c);
            assert_eq!(FRAME_TYPE_RETIRE_CONNECTION_ID, 0x0d);
            assert_eq!(FRAME_TYPE_PATH_CHALLENGE, 0x0e);
            assert_eq!(FRAME_TYPE_PATH_RESPONSE, 0x0f);
            assert_eq!(FRAME_TYPE_STREAM, 0x10);
            assert_eq!(FRAME_TYPE_CRYPTO, 0x18);
            assert_eq!(FRAME_TYPE_NEW_TOKEN, 0x19);
            assert_eq!(FRAME_TYPE_ACK, 0x1a);
            assert_eq!(FRAME_TYPE_ACK_ECN, 0x1b);
        }

        #[test]
        fn test_priority_table_order() {
            let close = Frame::ConnectionClose(ConnectionCloseFrame {
                error_code: 0,
                frame_type: 0,
                reason: Bytes::new(),
            });
            let ack = Frame::Ack(AckFrame::from_packet_numbers(&[1], 0).unwrap());
            let crypto = Frame::Crypto(CryptoFrame {
                offset: 0,
                data: Bytes::from_static(b"x"),
            });
            let stream = Frame::Stream(StreamFrame {
                stream_id: StreamId(0),
                offset: 0,
                fin: false,
                data: Bytes::new(),
            });
            let order = [
                close,
                Frame::PathResponse([0; 8]),
                ack,
                crypto,
                Frame::Ping,
                Frame::MaxData(1),
                Frame::MaxStreamId(StreamId(4)),
                Frame::MaxStreamId(StreamId(6)),
                Frame::DataBlocked(1),
                stream,
                Frame::Padding(1),
            ];
            for pair in order.windows(2) {
                assert!(pair[0].priority() < pair[1].priority(), "{} before {}", pair[0].name(), pair[1].name());
            }
        }

        #[test]
        fn test_ack_eliciting_and_retransmittable() {
            assert!(!Frame::Padding(3).is_ack_eliciting());
            assert!(!Frame::Ack(AckFrame::from_packet_numbers(&[0], 0).unwrap()).is_ack_eliciting());
            assert!(Frame::Ping.is_ack_eliciting());
            assert!(Frame::PathResponse([1; 8]).is_ack_eliciting());
            assert!(!Frame::PathResponse([1; 8]).is_retransmittable());
            assert!(Frame::MaxData(5).is_retransmittable());
        }
    }

    mod frame_codec_tests {
        use super::*;

        #[test]
        fn test_stream_frame_flags() {
            let frame = Frame::Stream(StreamFrame {
                stream_id: StreamId(4),
                offset: 100,
                fin: true,
                data: Bytes::from_static(b"hello"),
            });
            // STREAM | OFF | LEN | FIN
            assert_eq!(frame.frame_type(), 0x17);
            assert_eq!(roundtrip(frame.clone()), frame);

            let at_zero = Frame::Stream(StreamFrame {
                stream_id: StreamId(0),
                offset: 0,
                fin: false,
                data: Bytes::from_static(b"GET /\r\n"),
            });
            assert_eq!(at_zero.frame_type(), 0x12);
            assert_eq!(roundtrip(at_zero.clone()), at_zero);
        }

        #[test]
        fn test_stream_frame_without_length_takes_rest() {
            // 0x14: OFF set, LEN unset
            let payload = Bytes::from_static(&[0x14, 0x04, 0x08, b'a', b'b', b'c']);
            let (frame, consumed) = decode_frame(&payload, 0).unwrap();
            assert_eq!(consumed, 6);
            match frame {
                Frame::Stream(s) => {
                    assert_eq!(s.stream_id, StreamId(4));
                    assert_eq!(s.offset, 8);
                    assert_eq!(&s.data[..], b"abc");
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }

        #[test]
        fn test_control_frames_roundtrip() {
            let frames = vec![
                Frame::ResetStream(ResetStreamFrame {
                    stream_id: StreamId(8),
                    error_code: 7,
                    final_offset: 1024,
                }),
                Frame::ConnectionClose(ConnectionCloseFrame {
                    error_code: 0xa,
                    frame_type: 0x10,
                    reason: Bytes::from_static(b"bad stream"),
                }),
                Frame::ApplicationClose(ApplicationCloseFrame {
                    error_code: 1,
                    reason: Bytes::new(),
                }),
                Frame::MaxData(65536),
                Frame::MaxStreamData(MaxStreamDataFrame {
                    stream_id: StreamId(4),
                    maximum_stream_data: 16384,
                }),
                Frame::MaxStreamId(StreamId(41)),
                Frame::Ping,
                Frame::DataBlocked(300),
                Frame::StreamDataBlocked(StreamDataBlockedFrame {
                    stream_id: StreamId(0),
                    offset: 12,
                }),
                Frame::StreamIdBlocked(StreamId(2)),
                Frame::NewConnectionId(NewConnectionIdFrame {
                    sequence: 1,
                    connection_id: ConnectionId::from_slice(&[5; 8]).unwrap(),
                    stateless_reset_token: [0xab; 16],
                }),
                Frame::StopSending(StopSendingFrame {
                    stream_id: StreamId(4),
                    error_code: 3,
                }),
                Frame::RetireConnectionId(2),
                Frame::PathChallenge([1, 2, 3, 4, 5, 6, 7, 8]),
                Frame::PathResponse([8, 7, 6, 5, 4, 3, 2, 1]),
                Frame::Crypto(CryptoFrame {
                    offset: 5,
                    data: Bytes::from_static(b"client hello"),
                }),
                Frame::NewToken(Bytes::from_static(b"token")),
            ];
            for frame in frames {
                assert_eq!(roundtrip(frame.clone()), frame);
            }
        }

        #[test]
        fn test_ack_ecn_roundtrip() {
            let mut ack = AckFrame::from_packet_numbers(&[1, 2, 3, 7, 9, 10], 25).unwrap();
            let plain = Frame::Ack(ack.clone());
            assert_eq!(plain.frame_type(), FRAME_TYPE_ACK);
            assert_eq!(roundtrip(plain.clone()), plain);

            ack.ecn = Some(EcnCounts {
                ect0: 4,
                ect1: 0,
                ce: 1,
            });
            let ecn = Frame::Ack(ack);
            assert_eq!(ecn.frame_type(), FRAME_TYPE_ACK_ECN);
            assert_eq!(roundtrip(ecn.clone()), ecn);
        }

        #[test]
        fn test_padding_run_is_one_frame() {
            let frame = Frame::Padding(10);
            let mut buf = BytesMut::new();
            frame.encode(&mut buf).unwrap();
            buf.extend_from_slice(&[FRAME_TYPE_PING]);
            let frames = decode_frames(buf.freeze()).unwrap();
            assert_eq!(frames, vec![Frame::Padding(10), Frame::Ping]);
        }

        #[test]
        fn test_unknown_and_truncated_frames() {
            assert_eq!(
                decode_frame(&Bytes::from_static(&[0x1f]), 0),
                Err(Error::UnknownFrameType(0x1f))
            );
            assert_eq!(
                decode_frame(&Bytes::from_static(&[FRAME_TYPE_MAX_STREAM_DATA, 0x04]), 0),
                Err(Error::UnexpectedEnd)
            );
            assert_eq!(
                decode_frame(&Bytes::from_static(&[FRAME_TYPE_CRYPTO, 0x00, 0x05, 1, 2]), 0),
                Err(Error::UnexpectedEnd)
            );
        }

        #[test]
        fn test_iterator_stops_after_error() {
            let payload = Bytes::from_static(&[FRAME_TYPE_PING, 0x3f, FRAME_TYPE_PING]);
            let results: Vec<_> = FrameIterator::new(payload).collect();
            assert_eq!(results.len(), 2);
            assert!(results[0].is_ok());
            assert!(results[1].is_err());
        }

        #[test]
        fn test_ack_with_impossible_ranges_rejected() {
            // largest 1, first block 5
            let payload = Bytes::from_static(&[FRAME_TYPE_ACK, 0x01, 0x00, 0x00, 0x05]);
            assert!(matches!(
                decode_frame(&payload, 0),
                Err(Error::MalformedFrame { frame_type: FRAME_TYPE_ACK, .. })
            ));
        }
    }
}
