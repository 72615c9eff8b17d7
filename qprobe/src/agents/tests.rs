//! # Pipeline Tests
//!
//! Two complete pipelines, a client and a server, joined by in-memory links
//! instead of sockets. Both sides run the scripted TLS session and the
//! deterministic test crypto, so every agent is exercised end to end:
//!
//! 1. **Handshake** - both sides complete and reach `Established`
//! 2. **Streams** - data written on the client arrives in order on the server
//! 3. **Negotiation** - Version Negotiation restarts or fails the client

use super::*;
use crate::channel_config::ChannelConfig;
use crate::config::AgentConfig;
use crate::topics::{HandshakeStatus, Topics};
use bytes::{Bytes, BytesMut};
use qprobe_quic::crypto::testing::{ScriptedTlsSession, TestCryptoProvider};
use qprobe_quic::packet::{PacketLayout, VersionNegotiationHeader};
use qprobe_quic::{
    Connection, ConnectionConfig, ConnectionId, ConnectionState, Side, DRAFT_12, DRAFT_13,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn cid(byte: u8) -> ConnectionId {
    ConnectionId::from_slice(&[byte; 8]).unwrap()
}

fn client_connection() -> Connection {
    Connection::new(
        ConnectionConfig::client(cid(1), cid(2)),
        Arc::new(TestCryptoProvider),
    )
    .unwrap()
}

fn server_connection() -> Connection {
    Connection::new(
        ConnectionConfig::server(cid(2), cid(1)),
        Arc::new(TestCryptoProvider),
    )
    .unwrap()
}

fn spawn_side(conn: Connection, side: Side) -> (Pipeline, mpsc::Receiver<Bytes>) {
    Pipeline::spawn(
        conn,
        Box::new(ScriptedTlsSession::new(side)),
        &AgentConfig::default(),
        &ChannelConfig::default(),
    )
}

/// Deliver every datagram from `outgoing` to the other side's socket topic
fn link(mut outgoing: mpsc::Receiver<Bytes>, to: Topics) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(datagram) = outgoing.recv().await {
            to.datagrams_in.publish(datagram).await;
        }
    })
}

struct Pair {
    client: Pipeline,
    server: Pipeline,
    client_status: mpsc::Receiver<HandshakeStatus>,
    server_status: mpsc::Receiver<HandshakeStatus>,
    links: Vec<JoinHandle<()>>,
}

impl Pair {
    fn new() -> Self {
        let (client, client_out) = spawn_side(client_connection(), Side::Client);
        let (server, server_out) = spawn_side(server_connection(), Side::Server);
        // Nothing has run yet on the test runtime, so no status is missed
        let client_status = client.topics().handshake_status.subscribe();
        let server_status = server.topics().handshake_status.subscribe();
        let links = vec![
            link(client_out, server.topics().clone()),
            link(server_out, client.topics().clone()),
        ];
        Self {
            client,
            server,
            client_status,
            server_status,
            links,
        }
    }

    async fn complete_handshake(&mut self) {
        let client = timeout(WAIT, self.client_status.recv()).await.unwrap();
        let server = timeout(WAIT, self.server_status.recv()).await.unwrap();
        assert_eq!(client, Some(HandshakeStatus::Completed));
        assert_eq!(server, Some(HandshakeStatus::Completed));
    }

    async fn shutdown(self) {
        self.client.shutdown().await;
        self.server.shutdown().await;
        for link in self.links {
            link.abort();
        }
    }
}

// ============================================================================
// Handshake
// ============================================================================

mod handshake_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_handshake_completes_on_both_sides() {
        let mut pair = Pair::new();
        pair.complete_handshake().await;

        assert_eq!(pair.client.state(), ConnectionState::Established);
        assert_eq!(pair.server.state(), ConnectionState::Established);
        assert_eq!(pair.client.connection().lock().version(), DRAFT_13);
        pair.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_tls_reports_failure_and_closes() {
        let (client, _outgoing) = Pipeline::spawn(
            client_connection(),
            Box::new(ScriptedTlsSession::failing(Side::Client, "no cipher suites")),
            &AgentConfig::default(),
            &ChannelConfig::default(),
        );
        let mut status = client.topics().handshake_status.subscribe();

        match timeout(WAIT, status.recv()).await.unwrap() {
            Some(HandshakeStatus::Failed(reason)) => assert!(reason.contains("no cipher suites")),
            other => panic!("unexpected status {other:?}"),
        }
        timeout(WAIT, client.closed()).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtt_sampled_from_acks() {
        let mut pair = Pair::new();
        pair.complete_handshake().await;

        let ping = pair.client.send_frame(EncryptionLevel::Best, Frame::Ping).await;
        assert!(ping.is_ok());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(pair.client.rtt().samples > 0);
        pair.shutdown().await;
    }
}

// ============================================================================
// Streams
// ============================================================================

mod stream_tests {
    use super::*;

    async fn collect(
        deliveries: &mut mpsc::Receiver<qprobe_quic::StreamDelivery>,
    ) -> (Vec<u8>, bool) {
        let mut received = Vec::new();
        loop {
            let delivery = timeout(WAIT, deliveries.recv()).await.unwrap().unwrap();
            received.extend_from_slice(&delivery.data);
            if delivery.finished {
                return (received, true);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_data_delivered_in_order() {
        let mut pair = Pair::new();
        let mut deliveries = pair.server.topics().stream_data.subscribe();
        pair.complete_handshake().await;

        let stream_id = pair.client.open_stream(true);
        assert_eq!(stream_id.value(), 0);
        pair.client
            .write(stream_id, Bytes::from_static(b"GET /index.html\r\n"), true)
            .await
            .unwrap();

        let (received, finished) = collect(&mut deliveries).await;
        assert_eq!(received, b"GET /index.html\r\n");
        assert!(finished);
        pair.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_packet_write_reassembled() {
        let mut pair = Pair::new();
        let mut deliveries = pair.server.topics().stream_data.subscribe();
        pair.complete_handshake().await;

        let body: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let stream_id = pair.client.open_stream(true);
        pair.client
            .write(stream_id, Bytes::from(body.clone()), false)
            .await
            .unwrap();
        pair.client.close_stream(stream_id).await.unwrap();

        let (received, _) = collect(&mut deliveries).await;
        assert_eq!(received, body);
        pair.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_on_receive_only_stream_rejected() {
        let mut pair = Pair::new();
        pair.complete_handshake().await;

        // Server-initiated unidirectional stream
        let stream_id = qprobe_quic::StreamId::new(3);
        let result = pair.client.write(stream_id, Bytes::from_static(b"x"), false).await;
        assert!(matches!(result, Err(PipelineError::StreamDirection(id)) if id == stream_id));
        pair.shutdown().await;
    }
}

// ============================================================================
// Negotiation
// ============================================================================

mod negotiation_tests {
    use super::*;

    fn version_negotiation(offered: Vec<u32>) -> Bytes {
        let header = VersionNegotiationHeader {
            dcid: cid(1),
            scid: cid(2),
            supported_versions: offered,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.freeze()
    }

    fn version_of(datagram: &[u8]) -> Option<u32> {
        PacketLayout::peek(datagram, 8).unwrap().version
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_negotiation_restarts_with_offered_version() {
        let (client, mut outgoing) = spawn_side(client_connection(), Side::Client);

        let first = timeout(WAIT, outgoing.recv()).await.unwrap().unwrap();
        assert_eq!(version_of(&first), Some(DRAFT_13));

        client
            .topics()
            .datagrams_in
            .publish(version_negotiation(vec![0x1a2a_3a4a, DRAFT_12]))
            .await;

        let restarted = timeout(WAIT, outgoing.recv()).await.unwrap().unwrap();
        assert_eq!(version_of(&restarted), Some(DRAFT_12));
        assert_eq!(client.connection().lock().alpn(), "hq-12");
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_negotiation_without_common_version_fails() {
        let (client, mut outgoing) = spawn_side(client_connection(), Side::Client);
        let mut status = client.topics().handshake_status.subscribe();

        timeout(WAIT, outgoing.recv()).await.unwrap().unwrap();
        client
            .topics()
            .datagrams_in
            .publish(version_negotiation(vec![0x1a2a_3a4a]))
            .await;

        assert!(matches!(
            timeout(WAIT, status.recv()).await.unwrap(),
            Some(HandshakeStatus::Failed(_))
        ));
        timeout(WAIT, client.closed()).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
