//! Acknowledgement of received packets.
//!
//! Records every received packet number in its space and, for
//! ack-eliciting packets, queues an ACK frame covering everything pending
//! in that space. PATH_CHALLENGE frames are answered here too since the
//! response goes out at the same level as the ACK.

use super::{FrameQueueHandle, SharedConnection, Shutdown};
use qprobe_quic::{EncryptionLevel, Frame, Packet};
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub struct AckAgent {
    conn: SharedConnection,
    queue: FrameQueueHandle,
    packets: mpsc::Receiver<Arc<Packet>>,
    suppress_acks: bool,
    shutdown: Shutdown,
}

impl AckAgent {
    pub fn new(
        conn: SharedConnection,
        queue: FrameQueueHandle,
        packets: mpsc::Receiver<Arc<Packet>>,
        suppress_acks: bool,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            conn,
            queue,
            packets,
            suppress_acks,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        if self.suppress_acks {
            debug!("acknowledgements suppressed");
        }
        loop {
            select! {
                _ = self.shutdown.recv() => break,
                packet = self.packets.recv() => match packet {
                    Some(packet) => self.on_packet(&packet).await,
                    None => break,
                },
            }
        }
    }

    async fn on_packet(&mut self, packet: &Packet) {
        let Packet::Framed(packet) = packet else {
            return;
        };
        let level = packet.level();
        let space = level.space();
        let now = super::now();

        let (duplicate, ack) = {
            let mut conn = self.conn.lock();
            let duplicate = conn.record_received(space, packet.packet_number, now);
            let ack = if !self.suppress_acks && packet.is_ack_eliciting() {
                conn.ack_frame(space, now)
            } else {
                None
            };
            (duplicate, ack)
        };
        if duplicate {
            debug!(?space, packet_number = packet.packet_number, "duplicate packet");
        }

        let reply_level = reply_level(level);
        for frame in &packet.frames {
            if let Frame::PathChallenge(data) = frame {
                trace!("answering PATH_CHALLENGE");
                self.queue
                    .push(reply_level, Frame::PathResponse(*data))
                    .await;
            }
        }
        if let Some(ack) = ack {
            trace!(
                ?reply_level,
                largest = ack.largest_acknowledged,
                "queuing ACK"
            );
            self.queue.push(reply_level, Frame::Ack(ack)).await;
        }
    }
}

/// Level answering a packet received at `level`
///
/// 0-RTT packets share the application space but a client never accepts
/// 0-RTT packets, so they are acknowledged in 1-RTT ones.
pub fn reply_level(level: EncryptionLevel) -> EncryptionLevel {
    match level {
        EncryptionLevel::ZeroRtt => EncryptionLevel::OneRtt,
        other => other,
    }
}
