//! Round-trip time measurement.
//!
//! Logs every packet sent and updates the estimator from the ACK frames of
//! received packets. The latest estimate is published on a watch channel
//! so readers never wait on the agent.

use super::{SharedConnection, Shutdown};
use crate::topics::SentPacket;
use qprobe_quic::recovery::SentPacketLog;
use qprobe_quic::{Frame, Packet, RttEstimator};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Point-in-time copy of the RTT estimate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RttSnapshot {
    pub smoothed_rtt: Duration,
    pub rtt_var: Duration,
    pub min_rtt: Option<Duration>,
    pub latest_rtt: Duration,
    pub samples: u64,
}

impl RttSnapshot {
    fn of(estimator: &RttEstimator, samples: u64) -> Self {
        Self {
            smoothed_rtt: estimator.smoothed_rtt(),
            rtt_var: estimator.rtt_var(),
            min_rtt: estimator.min_rtt(),
            latest_rtt: estimator.latest_rtt(),
            samples,
        }
    }
}

pub struct RttAgent {
    conn: SharedConnection,
    sent: mpsc::Receiver<SentPacket>,
    received: mpsc::Receiver<Arc<Packet>>,
    publish: watch::Sender<RttSnapshot>,
    log: SentPacketLog,
    estimator: RttEstimator,
    samples: u64,
    shutdown: Shutdown,
}

impl RttAgent {
    pub fn new(
        conn: SharedConnection,
        sent: mpsc::Receiver<SentPacket>,
        received: mpsc::Receiver<Arc<Packet>>,
        publish: watch::Sender<RttSnapshot>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            conn,
            sent,
            received,
            publish,
            log: SentPacketLog::new(),
            estimator: RttEstimator::new(),
            samples: 0,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            select! {
                _ = self.shutdown.recv() => break,
                sent = self.sent.recv() => match sent {
                    Some(sent) => self.on_sent(&sent),
                    None => break,
                },
                packet = self.received.recv() => match packet {
                    Some(packet) => self.on_received(&packet),
                    None => break,
                },
            }
        }
        debug!(samples = self.samples, "rtt agent stopped");
    }

    fn on_sent(&mut self, sent: &SentPacket) {
        let packet = &sent.packet;
        self.log.on_packet_sent(
            packet.level().space(),
            packet.packet_number,
            sent.sent_at,
            !packet.is_ack_eliciting(),
            sent.size,
        );
    }

    fn on_received(&mut self, packet: &Packet) {
        let Packet::Framed(packet) = packet else {
            return;
        };
        let space = packet.level().space();
        let now = super::now();
        let exponent = self
            .conn
            .lock()
            .peer_transport_parameters()
            .map(|p| p.ack_delay_exponent);

        for frame in &packet.frames {
            let Frame::Ack(ack) = frame else {
                continue;
            };
            if self
                .log
                .on_ack(space, ack, now, exponent, &mut self.estimator)
            {
                self.samples += 1;
                let snapshot = RttSnapshot::of(&self.estimator, self.samples);
                debug!(
                    smoothed_rtt = ?snapshot.smoothed_rtt,
                    latest_rtt = ?snapshot.latest_rtt,
                    "rtt sample"
                );
                self.publish.send_replace(snapshot);
            }
        }
    }
}
