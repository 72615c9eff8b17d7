//! Retransmission of lost frames.
//!
//! Every sent packet's retransmittable frames are kept until an ACK covers
//! the packet. Frames come back when an ACK skips over their packet or when
//! the packet outlives the retransmit threshold; they are queued again one
//! by one, except for the client's first Initial packet which goes out
//! again as a whole so it keeps its padding and CRYPTO layout.
//!
//! Buffers are emptied when their frames can no longer matter:
//!
//! - Initial and Handshake once 1-RTT keys are available
//! - Initial or Handshake when that level's keys are dropped
//! - Initial when the peer sends an Initial packet without an ACK, as some
//!   servers never acknowledge in that space
//! - everything when a close frame is sent or received, or the connection
//!   starts closing

use super::{FrameQueueHandle, SenderHandle, Shutdown};
use crate::topics::SentPacket;
use qprobe_quic::recovery::RetransmitBatch;
use qprobe_quic::{
    ConnectionState, DirectionalEncryptionLevel, EncryptionLevel, FixedIntervalPolicy, Frame,
    Packet, PacketNumberSpace, RetransmitBuffer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub struct RecoveryAgent {
    sent: mpsc::Receiver<SentPacket>,
    received: mpsc::Receiver<Arc<Packet>>,
    levels: mpsc::Receiver<DirectionalEncryptionLevel>,
    states: mpsc::Receiver<ConnectionState>,
    buffer: RetransmitBuffer,
    policy: FixedIntervalPolicy,
    tick: Duration,
    queue: FrameQueueHandle,
    sender: SenderHandle,
    shutdown: Shutdown,
}

impl RecoveryAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sent: mpsc::Receiver<SentPacket>,
        received: mpsc::Receiver<Arc<Packet>>,
        levels: mpsc::Receiver<DirectionalEncryptionLevel>,
        states: mpsc::Receiver<ConnectionState>,
        threshold: Duration,
        tick: Duration,
        queue: FrameQueueHandle,
        sender: SenderHandle,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            sent,
            received,
            levels,
            states,
            buffer: RetransmitBuffer::new(),
            policy: FixedIntervalPolicy::new(threshold),
            tick,
            queue,
            sender,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = self.shutdown.recv() => break,

                sent = self.sent.recv() => match sent {
                    Some(sent) => {
                        let packet = &sent.packet;
                        self.buffer.on_packet_sent(
                            packet.level().space(),
                            packet.packet_number,
                            packet.level(),
                            &packet.frames,
                            sent.sent_at,
                        );
                        if packet.frames.iter().any(is_close) && !self.buffer.is_empty() {
                            debug!("close frame sent, emptying retransmission buffers");
                            self.buffer.clear_all();
                        }
                    }
                    None => break,
                },

                packet = self.received.recv() => match packet {
                    Some(packet) => self.on_received(&packet).await,
                    None => break,
                },

                event = self.levels.recv() => match event {
                    Some(event) => self.on_level(event),
                    None => break,
                },

                state = self.states.recv() => match state {
                    Some(state) if state.is_closing() && !self.buffer.is_empty() => {
                        debug!(state = state.name(), "connection closing, emptying retransmission buffers");
                        self.buffer.clear_all();
                    }
                    Some(_) => {}
                    None => break,
                },

                _ = ticker.tick() => {
                    let expired = self.buffer.expire(super::now(), &self.policy);
                    if !expired.is_empty() {
                        debug!(packets = expired.len(), "retransmit threshold exceeded");
                        self.requeue(expired).await;
                    }
                }
            }
        }
        debug!("recovery agent stopped");
    }

    async fn on_received(&mut self, packet: &Packet) {
        match packet {
            Packet::Framed(packet) => {
                let space = packet.level().space();
                for frame in &packet.frames {
                    let Frame::Ack(ack) = frame else {
                        continue;
                    };
                    match self.buffer.on_ack(space, ack) {
                        Ok(outcome) => {
                            if !outcome.unknown.is_empty() {
                                warn!(
                                    ?space,
                                    unknown = ?outcome.unknown,
                                    "peer acknowledged packets never sent"
                                );
                            }
                            if !outcome.lost.is_empty() {
                                debug!(?space, packets = outcome.lost.len(), "packets lost in ACK gaps");
                                self.requeue(outcome.lost).await;
                            }
                        }
                        Err(e) => warn!(?space, error = %e, "unusable ACK frame"),
                    }
                }

                let acked = packet.frames.iter().any(|f| matches!(f, Frame::Ack(_)));
                if !acked && space == PacketNumberSpace::Initial {
                    debug!(
                        packet_number = packet.packet_number,
                        "Initial packet without ACK, emptying its retransmission buffer"
                    );
                    self.buffer.clear(PacketNumberSpace::Initial);
                }
                if packet.frames.iter().any(is_close) {
                    debug!("peer closed, emptying retransmission buffers");
                    self.buffer.clear_all();
                }
            }
            // The attempt starts over; nothing sent so far is worth resending
            Packet::Retry { .. } | Packet::VersionNegotiation { .. } => {
                debug!("connection restarted, dropping retransmission state");
                self.buffer.clear_all();
            }
        }
    }

    fn on_level(&mut self, event: DirectionalEncryptionLevel) {
        match (event.level, event.available) {
            (EncryptionLevel::OneRtt, true) => {
                debug!("1-RTT keys available, emptying Initial and Handshake buffers");
                self.buffer.clear(PacketNumberSpace::Initial);
                self.buffer.clear(PacketNumberSpace::Handshake);
            }
            (level @ (EncryptionLevel::Initial | EncryptionLevel::Handshake), false) => {
                debug!(?level, "keys dropped, emptying retransmission buffer");
                self.buffer.clear(level.space());
            }
            _ => {}
        }
    }

    async fn requeue(&mut self, batches: Vec<RetransmitBatch>) {
        for batch in batches {
            if batch.is_first_initial() {
                match self.sender.try_send(batch.level, batch.frames) {
                    Ok(()) => continue,
                    Err(frames) => {
                        for frame in frames {
                            self.queue.push(batch.level, frame).await;
                        }
                    }
                }
            } else {
                for frame in batch.frames {
                    self.queue.push(batch.level, frame).await;
                }
            }
        }
    }
}

fn is_close(frame: &Frame) -> bool {
    matches!(frame, Frame::ConnectionClose(_) | Frame::ApplicationClose(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{now, QueueCommand, SenderCommand, ShutdownTrigger};
    use bytes::Bytes;
    use qprobe_quic::crypto::testing::{ScriptedTlsSession, TestCryptoProvider};
    use qprobe_quic::frames::{ConnectionCloseFrame, CryptoFrame};
    use qprobe_quic::{AckFrame, Connection, ConnectionConfig, ConnectionId, KeyDirection, Side};
    use tokio::task::JoinHandle;

    const THRESHOLD: Duration = Duration::from_millis(500);
    const TICK: Duration = Duration::from_millis(100);

    fn cid(byte: u8) -> ConnectionId {
        ConnectionId::from_slice(&[byte; 8]).unwrap()
    }

    /// Connection able to seal packets at every level
    fn connection(config: ConnectionConfig, side: Side) -> Connection {
        let mut conn = Connection::new(config, Arc::new(TestCryptoProvider)).unwrap();
        for level in [EncryptionLevel::Handshake, EncryptionLevel::OneRtt] {
            let secret = ScriptedTlsSession::secret(level, side);
            conn.install_keys(level, KeyDirection::Write, &secret).unwrap();
        }
        conn
    }

    fn close() -> Frame {
        Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: 0,
            frame_type: 0,
            reason: Bytes::from_static(b"done"),
        })
    }

    /// Let the agent drain its inputs
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    struct Harness {
        local: Connection,
        peer: Connection,
        sent: mpsc::Sender<SentPacket>,
        received: mpsc::Sender<Arc<Packet>>,
        levels: mpsc::Sender<DirectionalEncryptionLevel>,
        states: mpsc::Sender<ConnectionState>,
        queue: mpsc::Receiver<QueueCommand>,
        sender: mpsc::Receiver<SenderCommand>,
        trigger: ShutdownTrigger,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn new() -> Self {
            let trigger = ShutdownTrigger::new();
            let (sent, sent_rx) = mpsc::channel(16);
            let (received, received_rx) = mpsc::channel(16);
            let (levels, levels_rx) = mpsc::channel(16);
            let (states, states_rx) = mpsc::channel(16);
            let (queue_tx, queue) = mpsc::channel(64);
            let (sender_tx, sender) = mpsc::channel(16);
            let agent = RecoveryAgent::new(
                sent_rx,
                received_rx,
                levels_rx,
                states_rx,
                THRESHOLD,
                TICK,
                FrameQueueHandle::new(queue_tx),
                SenderHandle::new(sender_tx),
                trigger.subscribe(),
            );
            Self {
                local: connection(ConnectionConfig::client(cid(1), cid(2)), Side::Client),
                peer: connection(ConnectionConfig::server(cid(2), cid(1)), Side::Server),
                sent,
                received,
                levels,
                states,
                queue,
                sender,
                trigger,
                task: tokio::spawn(agent.run()),
            }
        }

        async fn send(&mut self, level: EncryptionLevel, frames: Vec<Frame>) {
            let encoded = self.local.encode_packet(level, frames).unwrap();
            let sent = SentPacket {
                packet: Arc::new(encoded.packet),
                sent_at: now(),
                size: encoded.datagram.len(),
            };
            self.sent.send(sent).await.unwrap();
            settle().await;
        }

        async fn receive(&mut self, level: EncryptionLevel, frames: Vec<Frame>) {
            let encoded = self.peer.encode_packet(level, frames).unwrap();
            self.received
                .send(Arc::new(Packet::Framed(encoded.packet)))
                .await
                .unwrap();
            settle().await;
        }

        async fn announce(&mut self, level: EncryptionLevel, direction: KeyDirection, available: bool) {
            let event = DirectionalEncryptionLevel {
                level,
                direction,
                available,
            };
            self.levels.send(event).await.unwrap();
            settle().await;
        }

        /// Frames queued again during the next `period`
        async fn requeued(&mut self, period: Duration) -> Vec<(EncryptionLevel, Frame)> {
            tokio::time::sleep(period).await;
            let mut frames = Vec::new();
            while let Ok(QueueCommand::Push { level, frame }) = self.queue.try_recv() {
                frames.push((level, frame));
            }
            frames
        }

        async fn shutdown(self) {
            self.trigger.fire();
            self.task.await.unwrap();
        }
    }

    mod timer_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_resubmitted_after_threshold_not_before() {
            let mut h = Harness::new();
            h.send(EncryptionLevel::Handshake, vec![Frame::Ping]).await;

            assert!(h.requeued(THRESHOLD).await.is_empty());
            assert_eq!(
                h.requeued(TICK).await,
                vec![(EncryptionLevel::Handshake, Frame::Ping)]
            );
            // Handed back once only
            assert!(h.requeued(THRESHOLD * 2).await.is_empty());
            h.shutdown().await;
        }

        #[tokio::test(start_paused = true)]
        async fn test_acknowledged_packet_not_resubmitted() {
            let mut h = Harness::new();
            h.send(EncryptionLevel::Handshake, vec![Frame::Ping]).await;
            let ack = AckFrame::from_packet_numbers(&[0], 0).unwrap();
            h.receive(EncryptionLevel::Handshake, vec![Frame::Ack(ack)]).await;

            assert!(h.requeued(THRESHOLD * 2).await.is_empty());
            h.shutdown().await;
        }

        #[tokio::test(start_paused = true)]
        async fn test_ack_gap_resubmits_immediately() {
            let mut h = Harness::new();
            h.send(EncryptionLevel::Handshake, vec![Frame::Ping]).await;
            h.send(EncryptionLevel::Handshake, vec![Frame::MaxData(7)]).await;
            h.send(EncryptionLevel::Handshake, vec![Frame::Ping]).await;
            let ack = AckFrame::from_packet_numbers(&[0, 2], 0).unwrap();
            h.receive(EncryptionLevel::Handshake, vec![Frame::Ack(ack)]).await;

            assert_eq!(
                h.requeued(Duration::from_millis(1)).await,
                vec![(EncryptionLevel::Handshake, Frame::MaxData(7))]
            );
            h.shutdown().await;
        }

        #[tokio::test(start_paused = true)]
        async fn test_first_initial_resent_as_whole_packet() {
            let mut h = Harness::new();
            let hello = Frame::Crypto(CryptoFrame {
                offset: 0,
                data: Bytes::from_static(b"client hello"),
            });
            h.send(EncryptionLevel::Initial, vec![hello.clone()]).await;

            tokio::time::sleep(THRESHOLD + TICK).await;
            match h.sender.try_recv() {
                Ok(SenderCommand::Send { level, frames }) => {
                    assert_eq!(level, EncryptionLevel::Initial);
                    assert_eq!(frames, vec![hello]);
                }
                other => panic!("unexpected {other:?}"),
            }
            assert!(h.queue.try_recv().is_err());
            h.shutdown().await;
        }
    }

    mod lifecycle_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_one_rtt_keys_clear_initial_and_handshake() {
            let mut h = Harness::new();
            h.send(EncryptionLevel::Initial, vec![Frame::Ping]).await;
            h.send(EncryptionLevel::Handshake, vec![Frame::Ping]).await;
            h.send(EncryptionLevel::OneRtt, vec![Frame::Ping]).await;
            h.announce(EncryptionLevel::OneRtt, KeyDirection::Write, true).await;

            assert_eq!(
                h.requeued(THRESHOLD + TICK).await,
                vec![(EncryptionLevel::OneRtt, Frame::Ping)]
            );
            h.shutdown().await;
        }

        #[tokio::test(start_paused = true)]
        async fn test_dropped_level_clears_its_space() {
            let mut h = Harness::new();
            h.send(EncryptionLevel::Initial, vec![Frame::Ping]).await;
            h.send(EncryptionLevel::Handshake, vec![Frame::MaxData(3)]).await;
            h.announce(EncryptionLevel::Initial, KeyDirection::Read, false).await;

            assert_eq!(
                h.requeued(THRESHOLD + TICK).await,
                vec![(EncryptionLevel::Handshake, Frame::MaxData(3))]
            );
            h.shutdown().await;
        }

        #[tokio::test(start_paused = true)]
        async fn test_new_handshake_keys_keep_buffers() {
            let mut h = Harness::new();
            h.send(EncryptionLevel::Initial, vec![Frame::Ping]).await;
            h.announce(EncryptionLevel::Handshake, KeyDirection::Read, true).await;

            assert_eq!(
                h.requeued(THRESHOLD + TICK).await,
                vec![(EncryptionLevel::Initial, Frame::Ping)]
            );
            h.shutdown().await;
        }

        #[tokio::test(start_paused = true)]
        async fn test_initial_without_ack_clears_initial() {
            let mut h = Harness::new();
            h.send(EncryptionLevel::Initial, vec![Frame::Ping]).await;
            h.send(EncryptionLevel::Handshake, vec![Frame::Ping]).await;
            h.receive(EncryptionLevel::Initial, vec![Frame::Ping]).await;

            assert_eq!(
                h.requeued(THRESHOLD + TICK).await,
                vec![(EncryptionLevel::Handshake, Frame::Ping)]
            );
            h.shutdown().await;
        }

        #[tokio::test(start_paused = true)]
        async fn test_close_sent_clears_everything() {
            let mut h = Harness::new();
            h.send(EncryptionLevel::Handshake, vec![Frame::Ping]).await;
            h.send(EncryptionLevel::OneRtt, vec![Frame::MaxData(9)]).await;
            h.send(EncryptionLevel::OneRtt, vec![close()]).await;

            assert!(h.requeued(THRESHOLD + TICK).await.is_empty());
            h.shutdown().await;
        }

        #[tokio::test(start_paused = true)]
        async fn test_close_received_clears_everything() {
            let mut h = Harness::new();
            h.send(EncryptionLevel::Handshake, vec![Frame::Ping]).await;
            h.send(EncryptionLevel::OneRtt, vec![Frame::MaxData(9)]).await;
            h.receive(EncryptionLevel::OneRtt, vec![close()]).await;

            assert!(h.requeued(THRESHOLD + TICK).await.is_empty());
            h.shutdown().await;
        }

        #[tokio::test(start_paused = true)]
        async fn test_closing_state_clears_everything() {
            let mut h = Harness::new();
            h.send(EncryptionLevel::OneRtt, vec![Frame::Ping]).await;
            h.states.send(ConnectionState::Closing).await.unwrap();
            settle().await;

            assert!(h.requeued(THRESHOLD + TICK).await.is_empty());
            h.shutdown().await;
        }
    }
}
