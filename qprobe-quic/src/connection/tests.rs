//! # Connection Tests
//!
//! End-to-end checks of the connection aggregate with the deterministic
//! crypto collaborator:
//!
//! 1. **Sending** - packet numbers, Initial padding, sample padding
//! 2. **Receiving** - two-pass decode, buffering for missing keys, AEAD drop
//! 3. **Restarts** - Version Negotiation and Retry
//! 4. **Streams** - delivery through flow control and reassembly

#![cfg(test)]

use super::*;
use crate::crypto::testing::{ScriptedTlsSession, TestCryptoProvider};
use crate::frames::{CryptoFrame, StreamFrame};
use crate::types::{MIN_INITIAL_LENGTH_V4, MIN_INITIAL_LENGTH_V6};
use crate::version::{DRAFT_12, DRAFT_13};
use core::time::Duration;

fn cid(byte: u8) -> ConnectionId {
    ConnectionId::from_slice(&[byte; 8]).unwrap()
}

fn client() -> Connection {
    Connection::new(
        ConnectionConfig::client(cid(1), cid(2)),
        Arc::new(TestCryptoProvider),
    )
    .unwrap()
}

fn server() -> Connection {
    Connection::new(
        ConnectionConfig::server(cid(2), cid(1)),
        Arc::new(TestCryptoProvider),
    )
    .unwrap()
}

fn crypto(data: &'static [u8]) -> Frame {
    Frame::Crypto(CryptoFrame {
        offset: 0,
        data: Bytes::from_static(data),
    })
}

fn install_both(client: &mut Connection, server: &mut Connection, level: EncryptionLevel) {
    let c = ScriptedTlsSession::secret(level, Side::Client);
    let s = ScriptedTlsSession::secret(level, Side::Server);
    client.install_keys(level, KeyDirection::Write, &c).unwrap();
    client.install_keys(level, KeyDirection::Read, &s).unwrap();
    server.install_keys(level, KeyDirection::Read, &c).unwrap();
    server.install_keys(level, KeyDirection::Write, &s).unwrap();
}

fn single_packet(decoded: Vec<Decoded>) -> DecodedPacket {
    assert_eq!(decoded.len(), 1, "{decoded:?}");
    match decoded.into_iter().next() {
        Some(Decoded::Packet(p)) => p,
        other => panic!("unexpected outcome {other:?}"),
    }
}

// ============================================================================
// Sending
// ============================================================================

mod sending_tests {
    use super::*;

    #[test]
    fn test_client_initial_padded_to_ipv4_minimum() {
        let mut conn = client();
        let encoded = conn
            .encode_packet(EncryptionLevel::Initial, vec![crypto(b"client hello")])
            .unwrap();
        assert_eq!(encoded.datagram.len(), MIN_INITIAL_LENGTH_V4);
        assert!(matches!(encoded.packet.frames.last(), Some(Frame::Padding(_))));
        assert_eq!(encoded.packet.packet_number, 0);
    }

    #[test]
    fn test_client_initial_padded_to_ipv6_minimum() {
        let mut config = ConnectionConfig::client(cid(1), cid(2));
        config.ipv6 = true;
        let mut conn = Connection::new(config, Arc::new(TestCryptoProvider)).unwrap();
        let encoded = conn
            .encode_packet(EncryptionLevel::Initial, vec![crypto(b"client hello")])
            .unwrap();
        assert_eq!(encoded.datagram.len(), MIN_INITIAL_LENGTH_V6);
    }

    #[test]
    fn test_empty_crypto_initial_padded_to_ipv4_minimum() {
        let mut conn = client();
        let encoded = conn
            .encode_packet(EncryptionLevel::Initial, vec![crypto(b"")])
            .unwrap();
        assert_eq!(encoded.datagram.len(), MIN_INITIAL_LENGTH_V4);
        assert!(matches!(encoded.packet.frames.last(), Some(Frame::Padding(_))));
    }

    #[test]
    fn test_empty_crypto_initial_padded_to_ipv6_minimum() {
        let mut config = ConnectionConfig::client(cid(1), cid(2));
        config.ipv6 = true;
        let mut conn = Connection::new(config, Arc::new(TestCryptoProvider)).unwrap();
        let encoded = conn
            .encode_packet(EncryptionLevel::Initial, vec![crypto(b"")])
            .unwrap();
        assert_eq!(encoded.datagram.len(), MIN_INITIAL_LENGTH_V6);
    }

    #[test]
    fn test_packet_numbers_increase_per_space() {
        let mut conn = client();
        let first = conn
            .encode_packet(EncryptionLevel::Initial, vec![Frame::Ping])
            .unwrap();
        let second = conn
            .encode_packet(EncryptionLevel::Initial, vec![Frame::Ping])
            .unwrap();
        assert_eq!(first.packet.packet_number, 0);
        assert_eq!(second.packet.packet_number, 1);
        assert!(second.packet.id > first.packet.id);
    }

    #[test]
    fn test_server_packets_padded_for_sample_only() {
        let mut conn = server();
        let encoded = conn
            .encode_packet(EncryptionLevel::Initial, vec![Frame::Ping])
            .unwrap();
        let pn_offset = encoded.packet.header.pn_offset();
        assert!(encoded.datagram.len() >= pn_offset + SAMPLE_OFFSET_FROM_PN + SAMPLE_LEN);
        assert!(encoded.datagram.len() < MIN_INITIAL_LENGTH_V4);
    }

    #[test]
    fn test_budget_fills_mtu() {
        let mut conn = server();
        let budget = conn.packet_budget(EncryptionLevel::Initial, 1200).unwrap();
        let encoded = conn
            .encode_packet(
                EncryptionLevel::Initial,
                vec![Frame::Ping, Frame::Padding(budget - 1)],
            )
            .unwrap();
        assert!(encoded.datagram.len() <= 1200);
        assert!(conn.packet_budget(EncryptionLevel::OneRtt, 1200).is_err());
    }

    #[test]
    fn test_missing_write_keys_rejected() {
        let mut conn = client();
        assert_eq!(
            conn.encode_packet(EncryptionLevel::Handshake, vec![Frame::Ping])
                .unwrap_err(),
            Error::KeysUnavailable(EncryptionLevel::Handshake)
        );
        // The failed attempt consumed no packet number
        assert_eq!(
            conn.space(PacketNumberSpace::Handshake)
                .unwrap()
                .next_packet_number(),
            0
        );
    }

    #[test]
    fn test_closed_connection_refuses_packets() {
        let mut conn = client();
        conn.on_closed();
        assert_eq!(
            conn.encode_packet(EncryptionLevel::Initial, vec![Frame::Ping])
                .unwrap_err(),
            Error::ConnectionClosed
        );
    }

    #[test]
    fn test_close_builds_frame_and_enters_closing() {
        let mut conn = client();
        let frame = conn.close(true, 7, "bye").unwrap();
        assert_eq!(
            frame,
            Frame::ApplicationClose(ApplicationCloseFrame {
                error_code: 7,
                reason: Bytes::from_static(b"bye"),
            })
        );
        assert_eq!(conn.state(), ConnectionState::Closing);
    }
}

// ============================================================================
// Receiving
// ============================================================================

mod receiving_tests {
    use super::*;

    #[test]
    fn test_initial_roundtrip_delivers_crypto_data() {
        let mut c = client();
        let mut s = server();
        let encoded = c
            .encode_packet(EncryptionLevel::Initial, vec![crypto(b"client hello")])
            .unwrap();

        let decoded = single_packet(s.decode_datagram(encoded.datagram));
        assert_eq!(decoded.packet.packet_number(), Some(0));
        assert_eq!(
            decoded.delivery.crypto,
            vec![(EncryptionLevel::Initial, Bytes::from_static(b"client hello"))]
        );
        assert_eq!(
            s.space(PacketNumberSpace::Initial).unwrap().largest_received(),
            Some(0)
        );
    }

    #[test]
    fn test_crypto_far_past_read_offset_rejected() {
        let mut c = client();
        let mut s = server();
        let frame = Frame::Crypto(CryptoFrame {
            offset: (1 << 62) - 100,
            data: Bytes::from_static(b"x"),
        });
        let encoded = c.encode_packet(EncryptionLevel::Initial, vec![frame]).unwrap();

        let decoded = single_packet(s.decode_datagram(encoded.datagram));
        assert!(decoded.delivery.crypto.is_empty());
        assert_eq!(
            decoded.delivery.violations,
            vec![ProtocolViolation::CryptoBufferExceeded {
                limit: crate::stream::CRYPTO_BUFFER_LIMIT,
                offset: (1 << 62) - 99,
            }]
        );

        // The stream is untouched and still delivers from offset zero
        let encoded = c
            .encode_packet(EncryptionLevel::Initial, vec![crypto(b"client hello")])
            .unwrap();
        let decoded = single_packet(s.decode_datagram(encoded.datagram));
        assert_eq!(
            decoded.delivery.crypto,
            vec![(EncryptionLevel::Initial, Bytes::from_static(b"client hello"))]
        );
    }

    #[test]
    fn test_packet_buffered_until_keys_arrive() {
        let mut c = client();
        let mut s = server();
        let c_secret = ScriptedTlsSession::secret(EncryptionLevel::Handshake, Side::Client);
        c.install_keys(EncryptionLevel::Handshake, KeyDirection::Write, &c_secret)
            .unwrap();
        let encoded = c
            .encode_packet(EncryptionLevel::Handshake, vec![crypto(b"finished")])
            .unwrap();

        let mut decoded = s.decode_datagram(encoded.datagram);
        let data = match decoded.pop() {
            Some(Decoded::Undecryptable { level, data }) => {
                assert_eq!(level, EncryptionLevel::Handshake);
                data
            }
            other => panic!("expected buffering, got {other:?}"),
        };

        s.install_keys(EncryptionLevel::Handshake, KeyDirection::Read, &c_secret)
            .unwrap();
        match s.decode_buffered(data) {
            Decoded::Packet(p) => assert_eq!(
                p.delivery.crypto,
                vec![(EncryptionLevel::Handshake, Bytes::from_static(b"finished"))]
            ),
            other => panic!("expected packet, got {other:?}"),
        }
    }

    #[test]
    fn test_tampered_packet_dropped() {
        let mut c = client();
        let mut s = server();
        let encoded = c
            .encode_packet(EncryptionLevel::Initial, vec![crypto(b"client hello")])
            .unwrap();
        let mut raw = encoded.datagram.to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;

        let decoded = s.decode_datagram(Bytes::from(raw));
        assert_eq!(decoded, vec![Decoded::Dropped(Error::DecryptionFailed)]);
        assert_eq!(
            s.space(PacketNumberSpace::Initial).unwrap().largest_received(),
            None
        );
    }

    #[test]
    fn test_coalesced_initial_and_handshake() {
        let mut c = client();
        let mut s = server();
        install_both(&mut c, &mut s, EncryptionLevel::Handshake);

        let initial = s
            .encode_packet(EncryptionLevel::Initial, vec![crypto(b"server hello")])
            .unwrap();
        let handshake = s
            .encode_packet(EncryptionLevel::Handshake, vec![crypto(b"server finished")])
            .unwrap();
        let mut datagram = BytesMut::new();
        datagram.extend_from_slice(&initial.datagram);
        datagram.extend_from_slice(&handshake.datagram);

        let decoded = c.decode_datagram(datagram.freeze());
        assert_eq!(decoded.len(), 2);
        let levels: Vec<EncryptionLevel> = decoded
            .iter()
            .filter_map(|d| match d {
                Decoded::Packet(p) => p.delivery.crypto.first().map(|(level, _)| *level),
                _ => None,
            })
            .collect();
        assert_eq!(levels, vec![EncryptionLevel::Initial, EncryptionLevel::Handshake]);
    }

    #[test]
    fn test_ack_frame_covers_received_packets() {
        let mut s = server();
        let start = Instant::now();
        assert!(s.ack_frame(PacketNumberSpace::Initial, start).is_none());
        assert!(!s.record_received(PacketNumberSpace::Initial, 0, start));
        assert!(!s.record_received(PacketNumberSpace::Initial, 2, start));
        assert!(s.record_received(PacketNumberSpace::Initial, 2, start));

        let ack = s
            .ack_frame(PacketNumberSpace::Initial, start + Duration::from_millis(1))
            .unwrap();
        assert_eq!(ack.largest_acknowledged, 2);
        assert_eq!(ack.acked_packets().unwrap(), vec![2, 0]);
    }

    #[test]
    fn test_peer_close_enters_closing() {
        let mut c = client();
        let mut s = server();
        let close = s.close(false, 0xa, "violation").unwrap();
        let encoded = s.encode_packet(EncryptionLevel::Initial, vec![close]).unwrap();
        let decoded = single_packet(c.decode_datagram(encoded.datagram));
        assert!(decoded.delivery.peer_closed);
        assert_eq!(c.state(), ConnectionState::Closing);
    }
}

// ============================================================================
// Restarts
// ============================================================================

mod restart_tests {
    use super::*;

    #[test]
    fn test_version_negotiation_restarts_with_offered_version() {
        let mut conn = client();
        conn.encode_packet(EncryptionLevel::Initial, vec![crypto(b"client hello")])
            .unwrap();

        let vn = VersionNegotiationHeader {
            dcid: cid(1),
            scid: cid(2),
            supported_versions: vec![0x1a2a_3a4a, DRAFT_12],
        };
        assert_eq!(conn.process_version_negotiation(&vn).unwrap(), DRAFT_12);
        assert_eq!(conn.version(), DRAFT_12);
        assert_eq!(conn.alpn(), "hq-12");
        assert_eq!(conn.state(), ConnectionState::Negotiating(DRAFT_12));

        let encoded = conn
            .encode_packet(EncryptionLevel::Initial, vec![crypto(b"client hello")])
            .unwrap();
        assert_eq!(encoded.packet.packet_number, 0);
        assert_eq!(encoded.packet.header.version(), Some(DRAFT_12));
    }

    #[test]
    fn test_failed_negotiation_keeps_version() {
        let mut conn = client();
        let vn = VersionNegotiationHeader {
            dcid: cid(1),
            scid: cid(2),
            supported_versions: vec![0x1a2a_3a4a],
        };
        assert_eq!(
            conn.process_version_negotiation(&vn),
            Err(Error::NoAppropriateVersion)
        );
        assert_eq!(conn.version(), DRAFT_13);
        assert_eq!(conn.negotiation(), NegotiationState::Failed);

        // A later offer does not revive the attempt
        let vn = VersionNegotiationHeader {
            supported_versions: vec![DRAFT_12],
            ..vn
        };
        assert!(conn.process_version_negotiation(&vn).is_err());
        assert_eq!(conn.version(), DRAFT_13);
    }

    #[test]
    fn test_retry_switches_destination_and_echoes_token() {
        let mut conn = client();
        conn.encode_packet(EncryptionLevel::Initial, vec![crypto(b"client hello")])
            .unwrap();
        let retry = RetryHeader {
            version: DRAFT_13,
            dcid: cid(1),
            scid: cid(9),
            original_dcid: cid(2),
            token: Bytes::from_static(b"token"),
        };
        assert!(conn.process_retry(&retry).unwrap());
        assert_eq!(conn.config().dcid, cid(9));
        assert_eq!(conn.original_dcid(), &cid(2));

        let encoded = conn
            .encode_packet(EncryptionLevel::Initial, vec![crypto(b"client hello")])
            .unwrap();
        assert_eq!(encoded.packet.packet_number, 0);
        match &encoded.packet.header {
            Header::Long(h) => {
                assert_eq!(h.token, Bytes::from_static(b"token"));
                assert_eq!(h.dcid, cid(9));
            }
            other => panic!("expected long header, got {other:?}"),
        }
        assert_eq!(encoded.datagram.len(), MIN_INITIAL_LENGTH_V4);

        // Only the first Retry counts
        assert!(!conn.process_retry(&retry).unwrap());
    }

    #[test]
    fn test_retry_with_wrong_original_id_rejected() {
        let mut conn = client();
        let retry = RetryHeader {
            version: DRAFT_13,
            dcid: cid(1),
            scid: cid(9),
            original_dcid: cid(7),
            token: Bytes::new(),
        };
        assert!(conn.process_retry(&retry).is_err());
        assert_eq!(conn.config().dcid, cid(2));
    }
}

// ============================================================================
// Streams
// ============================================================================

mod stream_tests {
    use super::*;

    fn established() -> (Connection, Connection) {
        let mut c = client();
        let mut s = server();
        install_both(&mut c, &mut s, EncryptionLevel::Handshake);
        install_both(&mut c, &mut s, EncryptionLevel::OneRtt);
        let c_params = c.local_transport_parameters().unwrap();
        let s_params = s.local_transport_parameters().unwrap();
        c.on_peer_transport_parameters(&s_params).unwrap();
        s.on_peer_transport_parameters(&c_params).unwrap();
        c.on_handshake_complete().unwrap();
        (c, s)
    }

    #[test]
    fn test_stream_data_delivered_in_order() {
        let (mut c, mut s) = established();
        let id = c.next_stream_id(true);
        assert_eq!(id, StreamId(0));
        assert_eq!(c.reserve_credit(id, 5, false).reserved, 5);
        let offset = c.stream_write(id, 5, true).unwrap();
        assert_eq!(offset, 0);

        let frame = Frame::Stream(StreamFrame {
            stream_id: id,
            offset,
            fin: true,
            data: Bytes::from_static(b"hello"),
        });
        let encoded = c.encode_packet(EncryptionLevel::OneRtt, vec![frame]).unwrap();
        assert!(!encoded.packet.header.is_long());

        let decoded = single_packet(s.decode_datagram(encoded.datagram));
        assert_eq!(
            decoded.delivery.streams,
            vec![StreamDelivery {
                stream_id: id,
                data: Bytes::from_static(b"hello"),
                finished: true,
            }]
        );
        assert!(decoded.delivery.violations.is_empty());
        // The receive window slid by the bytes consumed
        let updates = s.flow_control_frames(EncryptionLevel::OneRtt, 100);
        assert!(updates.iter().any(|f| matches!(f, Frame::MaxData(_))));
    }

    #[test]
    fn test_stream_beyond_limit_reported() {
        let (mut c, mut s) = established();
        let frame = Frame::Stream(StreamFrame {
            stream_id: StreamId(400),
            offset: 0,
            fin: false,
            data: Bytes::from_static(b"x"),
        });
        let encoded = c.encode_packet(EncryptionLevel::OneRtt, vec![frame]).unwrap();
        let decoded = single_packet(s.decode_datagram(encoded.datagram));
        assert_eq!(
            decoded.delivery.violations,
            vec![ProtocolViolation::InvalidStreamId { stream_id: 400 }]
        );
        assert!(decoded.delivery.streams.is_empty());
    }

    #[test]
    fn test_stream_far_past_read_offset_rejected() {
        let (mut c, mut s) = established();
        let frame = Frame::Stream(StreamFrame {
            stream_id: StreamId(0),
            offset: (1 << 62) - 100,
            fin: false,
            data: Bytes::from_static(b"x"),
        });
        let encoded = c.encode_packet(EncryptionLevel::OneRtt, vec![frame]).unwrap();
        let decoded = single_packet(s.decode_datagram(encoded.datagram));
        assert!(matches!(
            decoded.delivery.violations.as_slice(),
            [ProtocolViolation::FlowControlExceeded {
                stream_id: Some(0),
                offset,
                ..
            }] if *offset == (1 << 62) - 99
        ));
        assert!(decoded.delivery.streams.is_empty());
    }

    #[test]
    fn test_crypto_write_offsets_per_level() {
        let mut c = client();
        assert_eq!(c.crypto_write(EncryptionLevel::Initial, 12).unwrap(), 0);
        assert_eq!(c.crypto_write(EncryptionLevel::Initial, 4).unwrap(), 12);
        assert_eq!(c.crypto_write(EncryptionLevel::Handshake, 4).unwrap(), 0);
    }

    #[test]
    fn test_transition_refused_once_established() {
        let (mut c, _) = established();
        let alpn = c.alpn().to_string();
        assert!(c.transition_to(DRAFT_12, alpn).is_err());
        assert_eq!(c.version(), DRAFT_13);
        assert!(c.flow().is_ready());
    }

    #[test]
    fn test_transition_clears_streams() {
        let mut c = client();
        let mut s = server();
        let params = s.local_transport_parameters().unwrap();
        c.on_peer_transport_parameters(&params).unwrap();
        c.reserve_credit(StreamId(0), 1, false);
        assert!(!c.streams().is_empty());
        let alpn = c.alpn().to_string();
        let events = c.transition_to(DRAFT_12, alpn).unwrap();
        assert!(c.streams().is_empty());
        assert!(!c.flow().is_ready());
        assert!(events.iter().all(|e| e.level == EncryptionLevel::Initial && e.available));
    }
}
