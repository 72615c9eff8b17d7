//! # Flow Control
//!
//! Credit-based limits at two levels:
//! - **Connection**: total bytes across all streams (MAX_DATA)
//! - **Stream**: bytes per stream (MAX_STREAM_DATA), kept on the [`Stream`]
//!
//! Stream counts are limited too. The peer grants us stream ids through
//! its transport parameters and MAX_STREAM_ID frames; we grant it ids
//! through ours.
//!
//! Sending reserves credit from both pools at once. When a reservation
//! falls short, the matching STREAM_BLOCKED, BLOCKED or STREAM_ID_BLOCKED
//! frame is returned exactly once until a larger limit arrives.
//!
//! Receiving optionally slides the window: every new byte read from the
//! peer extends our connection and stream credit by the same amount.

#![forbid(unsafe_code)]

use crate::crypto::EncryptionLevel;
use crate::error::ProtocolViolation;
use crate::frames::{Frame, MaxStreamDataFrame, StreamDataBlockedFrame, StreamFrame};
use crate::stream::Stream;
use crate::transport::TransportParameters;
use crate::types::{Side, StreamId, StreamType};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// Highest stream id usable under a stream count limit
///
/// A limit of `n` admits ids up to `type + 4n`; a limit of zero admits none.
pub fn max_stream_id(limit: u64, initiator: Side, bidirectional: bool) -> Option<StreamId> {
    if limit == 0 {
        return None;
    }
    Some(StreamType::new(initiator, bidirectional).nth(limit))
}

pub fn max_bidi_client_stream_id(limit: u64) -> Option<StreamId> {
    max_stream_id(limit, Side::Client, true)
}

pub fn max_bidi_server_stream_id(limit: u64) -> Option<StreamId> {
    max_stream_id(limit, Side::Server, true)
}

pub fn max_uni_client_stream_id(limit: u64) -> Option<StreamId> {
    max_stream_id(limit, Side::Client, false)
}

pub fn max_uni_server_stream_id(limit: u64) -> Option<StreamId> {
    max_stream_id(limit, Side::Server, false)
}

/// Limits taken from one endpoint's transport parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowControlLimits {
    pub streams_bidi: u64,
    pub streams_uni: u64,
    pub max_data: u64,
    pub max_stream_data_bidi_local: u64,
    pub max_stream_data_bidi_remote: u64,
    pub max_stream_data_uni: u64,
}

impl FlowControlLimits {
    pub fn from_params(params: &TransportParameters) -> Self {
        Self {
            streams_bidi: params.initial_max_bidi_streams,
            streams_uni: params.initial_max_uni_streams,
            max_data: params.initial_max_data,
            max_stream_data_bidi_local: params.initial_max_stream_data_bidi_local,
            max_stream_data_bidi_remote: params.initial_max_stream_data_bidi_remote,
            max_stream_data_uni: params.initial_max_stream_data_uni,
        }
    }
}

/// Outcome of a credit reservation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reservation {
    /// Bytes granted, possibly zero
    pub reserved: u64,
    /// Blocking frames to queue at the best application data level
    pub signals: Vec<Frame>,
}

/// Connection and stream credit bookkeeping
#[derive(Debug, Clone)]
pub struct FlowController {
    side: Side,
    local: FlowControlLimits,
    remote: FlowControlLimits,
    /// Stream ids the peer lets us open
    remote_max_bidi: Option<StreamId>,
    remote_max_uni: Option<StreamId>,
    slide_window: bool,
    ready: bool,

    data_reserved: u64,
    data_read: u64,

    data_blocked: bool,
    bidi_streams_blocked: bool,
    uni_streams_blocked: bool,
    blocked_streams: BTreeSet<StreamId>,

    data_limits_changed: bool,
    stream_data_limits: BTreeMap<StreamId, u64>,
}

impl FlowController {
    pub fn new(side: Side, slide_window: bool) -> Self {
        Self {
            side,
            local: FlowControlLimits::default(),
            remote: FlowControlLimits::default(),
            remote_max_bidi: None,
            remote_max_uni: None,
            slide_window,
            ready: false,
            data_reserved: 0,
            data_read: 0,
            data_blocked: false,
            bidi_streams_blocked: false,
            uni_streams_blocked: false,
            blocked_streams: BTreeSet::new(),
            data_limits_changed: false,
            stream_data_limits: BTreeMap::new(),
        }
    }

    /// Both endpoints' parameters are known; credit can be reserved
    pub fn on_transport_parameters(
        &mut self,
        local: &TransportParameters,
        remote: &TransportParameters,
    ) {
        self.local = FlowControlLimits::from_params(local);
        self.remote = FlowControlLimits::from_params(remote);
        self.remote_max_bidi = max_stream_id(self.remote.streams_bidi, self.side, true);
        self.remote_max_uni = max_stream_id(self.remote.streams_uni, self.side, false);
        self.ready = true;
        debug!(
            max_data = self.remote.max_data,
            local_max_data = self.local.max_data,
            "flow control limits initialised"
        );
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn local_limits(&self) -> &FlowControlLimits {
        &self.local
    }

    pub fn remote_limits(&self) -> &FlowControlLimits {
        &self.remote
    }

    pub fn data_reserved(&self) -> u64 {
        self.data_reserved
    }

    pub fn data_read(&self) -> u64 {
        self.data_read
    }

    /// Set a stream's unset limits from the negotiated parameters
    ///
    /// The write limit comes from the peer's parameters and is skipped for
    /// streams we cannot send on. The read limit comes from ours and is
    /// skipped for streams we cannot receive on. For bidirectional streams
    /// "local" is from the initiator's point of view, so the source depends
    /// on which endpoint opened the stream.
    pub fn init_stream_limits(&self, stream: &mut Stream) {
        let id = stream.id();
        let ours = id.is_local(self.side);

        if stream.write_limit.is_none() && id.can_send(self.side) {
            let limit = if id.is_unidirectional() {
                self.remote.max_stream_data_uni
            } else if ours {
                self.remote.max_stream_data_bidi_remote
            } else {
                self.remote.max_stream_data_bidi_local
            };
            stream.write_limit = Some(limit);
            trace!(stream = id.value(), limit, "initialised stream write limit");
        }
        if stream.read_limit.is_none() && id.can_receive(self.side) {
            let limit = if id.is_unidirectional() {
                self.local.max_stream_data_uni
            } else if ours {
                self.local.max_stream_data_bidi_local
            } else {
                self.local.max_stream_data_bidi_remote
            };
            stream.read_limit = Some(limit);
            trace!(stream = id.value(), limit, "initialised stream read limit");
        }
    }

    /// Reserve exactly `credit` bytes on `stream`, or nothing
    pub fn reserve_credit(&mut self, stream: &mut Stream, credit: u64) -> Reservation {
        self.reserve(stream, credit, false)
    }

    /// Reserve as much of `credit` as both pools allow
    pub fn reserve_at_most(&mut self, stream: &mut Stream, credit: u64) -> Reservation {
        self.reserve(stream, credit, true)
    }

    fn reserve(&mut self, stream: &mut Stream, mut credit: u64, partial: bool) -> Reservation {
        let mut reservation = Reservation::default();
        if !self.ready {
            return reservation;
        }

        let id = stream.id();
        if id.is_local(self.side) {
            let bidi = id.is_bidirectional();
            let (max, blocked) = if bidi {
                (self.remote_max_bidi, &mut self.bidi_streams_blocked)
            } else {
                (self.remote_max_uni, &mut self.uni_streams_blocked)
            };
            if max.map_or(true, |max| max < id) {
                if !*blocked {
                    *blocked = true;
                    let limit = max.unwrap_or_else(|| StreamType::new(self.side, bidi).nth(0));
                    reservation.signals.push(Frame::StreamIdBlocked(limit));
                    debug!(stream = id.value(), limit = limit.value(), "stream id blocked");
                }
                return reservation;
            }
        }

        self.init_stream_limits(stream);
        let write_limit = stream.write_limit.unwrap_or(0);

        if partial {
            // Each pool is clamped on its own; concurrent reservations across
            // streams can starve one of the two.
            credit = credit
                .min(write_limit.saturating_sub(stream.write_reserved))
                .min(credit.min(self.remote.max_data.saturating_sub(self.data_reserved)));
        }

        if stream.write_reserved + credit <= write_limit
            && self.data_reserved + credit <= self.remote.max_data
        {
            stream.write_reserved += credit;
            self.data_reserved += credit;
            reservation.reserved = credit;
            trace!(stream = id.value(), credit, "reserved credit");
        }

        if !self.blocked_streams.contains(&id)
            && (stream.write_reserved >= write_limit || reservation.reserved < credit)
        {
            self.blocked_streams.insert(id);
            reservation
                .signals
                .push(Frame::StreamDataBlocked(StreamDataBlockedFrame {
                    stream_id: id,
                    offset: write_limit,
                }));
            debug!(stream = id.value(), limit = write_limit, "stream data blocked");
        }

        if !self.data_blocked && self.data_reserved >= self.remote.max_data {
            self.data_blocked = true;
            reservation.signals.push(Frame::DataBlocked(self.remote.max_data));
            debug!(limit = self.remote.max_data, "connection data blocked");
        }

        reservation
    }

    /// MAX_DATA from the peer; regressions are ignored
    pub fn on_max_data(&mut self, maximum_data: u64) {
        if maximum_data < self.remote.max_data {
            debug!(maximum_data, current = self.remote.max_data, "ignoring non-increasing MAX_DATA");
            return;
        }
        if maximum_data > self.remote.max_data {
            self.data_blocked = false;
        }
        self.remote.max_data = maximum_data;
    }

    /// MAX_STREAM_DATA from the peer; regressions are ignored
    pub fn on_max_stream_data(&mut self, stream: &mut Stream, maximum_stream_data: u64) {
        if !stream.id().can_send(self.side) {
            debug!(stream = stream.id().value(), "MAX_STREAM_DATA for a receive-only stream");
            return;
        }
        self.init_stream_limits(stream);
        let current = stream.write_limit.unwrap_or(0);
        if maximum_stream_data < current {
            debug!(
                stream = stream.id().value(),
                maximum_stream_data, current, "ignoring non-increasing MAX_STREAM_DATA"
            );
            return;
        }
        if maximum_stream_data > current {
            self.blocked_streams.remove(&stream.id());
        }
        stream.write_limit = Some(maximum_stream_data);
    }

    /// MAX_STREAM_ID from the peer; regressions are ignored
    pub fn on_max_stream_id(&mut self, maximum: StreamId) {
        if !maximum.is_local(self.side) {
            debug!(stream = maximum.value(), "MAX_STREAM_ID for peer-initiated streams");
            return;
        }
        let (current, blocked) = if maximum.is_bidirectional() {
            (&mut self.remote_max_bidi, &mut self.bidi_streams_blocked)
        } else {
            (&mut self.remote_max_uni, &mut self.uni_streams_blocked)
        };
        match *current {
            Some(c) if maximum < c => {
                debug!(stream = maximum.value(), "ignoring non-increasing MAX_STREAM_ID");
            }
            Some(c) if maximum == c => {}
            _ => {
                *blocked = false;
                *current = Some(maximum);
            }
        }
    }

    /// Check an inbound STREAM frame against our limits and consume credit
    ///
    /// Must run before the frame is inserted into the stream.
    pub fn on_stream_frame(
        &mut self,
        stream: &mut Stream,
        frame: &StreamFrame,
    ) -> Result<(), ProtocolViolation> {
        let id = stream.id();
        if !id.is_local(self.side) {
            let limit = if id.is_bidirectional() {
                self.local.streams_bidi
            } else {
                self.local.streams_uni
            };
            let max = max_stream_id(limit, self.side.opposite(), id.is_bidirectional());
            if max.map_or(true, |max| max < id) {
                return Err(ProtocolViolation::InvalidStreamId {
                    stream_id: id.value(),
                });
            }
        }

        self.init_stream_limits(stream);
        let end = frame.end();
        if let Some(limit) = stream.read_limit {
            if end > limit {
                return Err(ProtocolViolation::FlowControlExceeded {
                    stream_id: Some(id.value()),
                    limit,
                    offset: end,
                });
            }
        }

        let required = end.saturating_sub(stream.max_read_received());
        if required == 0 {
            return Ok(());
        }
        if self.data_read + required > self.local.max_data {
            return Err(ProtocolViolation::FlowControlExceeded {
                stream_id: None,
                limit: self.local.max_data,
                offset: self.data_read + required,
            });
        }
        self.data_read += required;

        if self.slide_window {
            self.local.max_data += required;
            self.data_limits_changed = true;
            let limit = stream.read_limit.unwrap_or(0) + required;
            stream.read_limit = Some(limit);
            self.stream_data_limits.insert(id, limit);
        }
        Ok(())
    }

    /// Window updates fitting in `available` bytes
    ///
    /// Only 0-RTT and 1-RTT packets carry them. Frames that don't fit stay
    /// pending.
    pub fn pending_frames(&mut self, level: EncryptionLevel, available: usize) -> Vec<Frame> {
        if !matches!(level, EncryptionLevel::ZeroRtt | EncryptionLevel::OneRtt) {
            return Vec::new();
        }
        let mut frames = Vec::new();
        let mut total = 0;

        if self.data_limits_changed {
            let frame = Frame::MaxData(self.local.max_data);
            if total + frame.wire_len() < available {
                total += frame.wire_len();
                frames.push(frame);
                self.data_limits_changed = false;
            }
        }

        let mut sent = Vec::new();
        for (stream_id, limit) in &self.stream_data_limits {
            let frame = Frame::MaxStreamData(MaxStreamDataFrame {
                stream_id: *stream_id,
                maximum_stream_data: *limit,
            });
            if total + frame.wire_len() < available {
                total += frame.wire_len();
                frames.push(frame);
                sent.push(*stream_id);
            }
        }
        for stream_id in sent {
            self.stream_data_limits.remove(&stream_id);
        }
        frames
    }

    pub fn is_stream_blocked(&self, stream_id: StreamId) -> bool {
        self.blocked_streams.contains(&stream_id)
    }

    pub fn is_data_blocked(&self) -> bool {
        self.data_blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn params(max_data: u64, stream_data: u64, streams: u64) -> TransportParameters {
        TransportParameters {
            initial_max_data: max_data,
            initial_max_stream_data_bidi_local: stream_data,
            initial_max_stream_data_bidi_remote: stream_data,
            initial_max_stream_data_uni: stream_data,
            initial_max_bidi_streams: streams,
            initial_max_uni_streams: streams,
            ..TransportParameters::default()
        }
    }

    fn client(local: TransportParameters, remote: TransportParameters, slide: bool) -> FlowController {
        let mut fc = FlowController::new(Side::Client, slide);
        fc.on_transport_parameters(&local, &remote);
        fc
    }

    fn data(offset: u64, len: usize) -> StreamFrame {
        StreamFrame {
            stream_id: StreamId(0),
            offset,
            fin: false,
            data: Bytes::from(vec![0u8; len]),
        }
    }

    mod helper_tests {
        use super::*;

        #[test]
        fn test_max_stream_ids() {
            assert_eq!(max_bidi_client_stream_id(0), None);
            assert_eq!(max_bidi_client_stream_id(2), Some(StreamId(8)));
            assert_eq!(max_bidi_server_stream_id(2), Some(StreamId(9)));
            assert_eq!(max_uni_client_stream_id(1), Some(StreamId(6)));
            assert_eq!(max_uni_server_stream_id(1), Some(StreamId(7)));
        }
    }

    mod limit_tests {
        use super::*;

        #[test]
        fn test_limits_by_initiator() {
            let local = TransportParameters {
                initial_max_stream_data_bidi_local: 10,
                initial_max_stream_data_bidi_remote: 20,
                initial_max_stream_data_uni: 30,
                ..TransportParameters::default()
            };
            let remote = TransportParameters {
                initial_max_stream_data_bidi_local: 40,
                initial_max_stream_data_bidi_remote: 50,
                initial_max_stream_data_uni: 60,
                ..TransportParameters::default()
            };
            let fc = client(local, remote, true);

            let mut own_bidi = Stream::new(StreamId(0));
            fc.init_stream_limits(&mut own_bidi);
            assert_eq!(own_bidi.write_limit(), Some(50));
            assert_eq!(own_bidi.read_limit(), Some(10));

            let mut peer_bidi = Stream::new(StreamId(1));
            fc.init_stream_limits(&mut peer_bidi);
            assert_eq!(peer_bidi.write_limit(), Some(40));
            assert_eq!(peer_bidi.read_limit(), Some(20));

            let mut own_uni = Stream::new(StreamId(2));
            fc.init_stream_limits(&mut own_uni);
            assert_eq!(own_uni.write_limit(), Some(60));
            assert_eq!(own_uni.read_limit(), None);

            let mut peer_uni = Stream::new(StreamId(3));
            fc.init_stream_limits(&mut peer_uni);
            assert_eq!(peer_uni.write_limit(), None);
            assert_eq!(peer_uni.read_limit(), Some(30));
        }

        #[test]
        fn test_non_increasing_limits_ignored() {
            let mut fc = client(params(100, 100, 1), params(100, 100, 1), true);
            fc.on_max_data(50);
            assert_eq!(fc.remote_limits().max_data, 100);
            fc.on_max_data(150);
            assert_eq!(fc.remote_limits().max_data, 150);

            let mut s = Stream::new(StreamId(0));
            fc.on_max_stream_data(&mut s, 10);
            assert_eq!(s.write_limit(), Some(100));
            fc.on_max_stream_data(&mut s, 200);
            assert_eq!(s.write_limit(), Some(200));
        }
    }

    mod reservation_tests {
        use super::*;

        #[test]
        fn test_not_ready_reserves_nothing() {
            let mut fc = FlowController::new(Side::Client, true);
            let mut s = Stream::new(StreamId(0));
            assert_eq!(fc.reserve_credit(&mut s, 10), Reservation::default());
        }

        #[test]
        fn test_blocked_signalled_once_per_episode() {
            let mut fc = client(params(1000, 1000, 1), params(1000, 100, 1), true);
            let mut s = Stream::new(StreamId(0));

            let first = fc.reserve_credit(&mut s, 150);
            assert_eq!(first.reserved, 0);
            assert_eq!(
                first.signals,
                vec![Frame::StreamDataBlocked(StreamDataBlockedFrame {
                    stream_id: StreamId(0),
                    offset: 100
                })]
            );

            let second = fc.reserve_credit(&mut s, 150);
            assert_eq!(second.reserved, 0);
            assert!(second.signals.is_empty());

            // A larger limit ends the episode
            fc.on_max_stream_data(&mut s, 300);
            assert!(!fc.is_stream_blocked(StreamId(0)));
            let third = fc.reserve_credit(&mut s, 150);
            assert_eq!(third.reserved, 150);
            assert!(third.signals.is_empty());
        }

        #[test]
        fn test_partial_reservation_and_data_blocked() {
            let mut fc = client(params(1000, 1000, 4), params(120, 100, 4), true);
            let mut a = Stream::new(StreamId(0));
            let mut b = Stream::new(StreamId(4));

            let ra = fc.reserve_at_most(&mut a, 80);
            assert_eq!(ra.reserved, 80);
            let rb = fc.reserve_at_most(&mut b, 80);
            // Connection pool has 40 left
            assert_eq!(rb.reserved, 40);
            assert!(rb.signals.contains(&Frame::DataBlocked(120)));
            assert!(fc.is_data_blocked());
            assert_eq!(fc.data_reserved(), 120);

            fc.on_max_data(200);
            assert!(!fc.is_data_blocked());
        }

        #[test]
        fn test_stream_id_limit() {
            // One bidirectional stream allowed: ids 0 and 4
            let mut fc = client(params(1000, 1000, 1), params(1000, 1000, 1), true);
            let mut s = Stream::new(StreamId(8));
            let r = fc.reserve_credit(&mut s, 10);
            assert_eq!(r.reserved, 0);
            assert_eq!(r.signals, vec![Frame::StreamIdBlocked(StreamId(4))]);
            assert!(fc.reserve_credit(&mut s, 10).signals.is_empty());

            fc.on_max_stream_id(StreamId(8));
            assert_eq!(fc.reserve_credit(&mut s, 10).reserved, 10);
        }

        proptest! {
            #[test]
            fn test_reservations_never_exceed_limit(
                limit in 0u64..5000,
                requests in proptest::collection::vec((0u64..2000, any::<bool>()), 1..40),
            ) {
                let mut fc = client(params(1 << 20, 1 << 20, 4), params(1 << 20, limit, 4), true);
                let mut s = Stream::new(StreamId(0));
                let mut total = 0;
                let mut stream_blocked_signals = 0;
                for (credit, partial) in requests {
                    let r = if partial {
                        fc.reserve_at_most(&mut s, credit)
                    } else {
                        fc.reserve_credit(&mut s, credit)
                    };
                    total += r.reserved;
                    stream_blocked_signals += r
                        .signals
                        .iter()
                        .filter(|f| matches!(f, Frame::StreamDataBlocked(_)))
                        .count();
                }
                prop_assert!(total <= limit);
                prop_assert_eq!(s.write_reserved(), total);
                prop_assert!(stream_blocked_signals <= 1);
            }
        }
    }

    mod receive_tests {
        use super::*;

        #[test]
        fn test_sliding_window_extends_credit() {
            let mut fc = client(params(100, 50, 1), params(100, 50, 1), true);
            let mut s = Stream::new(StreamId(0));
            fc.on_stream_frame(&mut s, &data(0, 30)).unwrap();
            s.add_to_read(&data(0, 30), Side::Client);
            assert_eq!(fc.data_read(), 30);
            assert_eq!(fc.local_limits().max_data, 130);
            assert_eq!(s.read_limit(), Some(80));

            // Retransmission needs no new credit
            fc.on_stream_frame(&mut s, &data(0, 30)).unwrap();
            assert_eq!(fc.data_read(), 30);

            let frames = fc.pending_frames(EncryptionLevel::OneRtt, 1200);
            assert_eq!(
                frames,
                vec![
                    Frame::MaxData(130),
                    Frame::MaxStreamData(MaxStreamDataFrame {
                        stream_id: StreamId(0),
                        maximum_stream_data: 80
                    })
                ]
            );
            assert!(fc.pending_frames(EncryptionLevel::OneRtt, 1200).is_empty());
        }

        #[test]
        fn test_updates_only_in_application_packets() {
            let mut fc = client(params(100, 50, 1), params(100, 50, 1), true);
            let mut s = Stream::new(StreamId(0));
            fc.on_stream_frame(&mut s, &data(0, 10)).unwrap();
            assert!(fc.pending_frames(EncryptionLevel::Handshake, 1200).is_empty());
            assert_eq!(fc.pending_frames(EncryptionLevel::OneRtt, 1200).len(), 2);
        }

        #[test]
        fn test_fixed_window_rejects_excess() {
            let mut fc = client(params(100, 50, 1), params(100, 50, 1), false);
            let mut s = Stream::new(StreamId(0));
            fc.on_stream_frame(&mut s, &data(0, 50)).unwrap();
            assert_eq!(
                fc.on_stream_frame(&mut s, &data(50, 1)),
                Err(ProtocolViolation::FlowControlExceeded {
                    stream_id: Some(0),
                    limit: 50,
                    offset: 51
                })
            );
            assert!(fc.pending_frames(EncryptionLevel::OneRtt, 1200).is_empty());
        }

        #[test]
        fn test_peer_stream_beyond_limit() {
            // Server-initiated bidi ids 1 and 5 are allowed with a limit of one
            let mut fc = client(params(100, 50, 1), params(100, 50, 1), true);
            let mut s = Stream::new(StreamId(9));
            let frame = StreamFrame {
                stream_id: StreamId(9),
                ..data(0, 1)
            };
            assert_eq!(
                fc.on_stream_frame(&mut s, &frame),
                Err(ProtocolViolation::InvalidStreamId { stream_id: 9 })
            );
        }
    }
}
