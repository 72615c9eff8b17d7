//! Packet assembly and transmission.
//!
//! The sender owns no frames. When woken it visits every level with write
//! keys and fills packets by pulling from its producers in a fixed order:
//! the frame queue for the level itself, then for `Best` and `BestAppData`
//! when those resolve to it, then stream data and window updates for the
//! application levels. Small announcements are coalesced for a short delay
//! unless a full packet is already waiting.
//!
//! Whole packets handed over with [`SenderCommand::Send`] bypass the
//! producers; when their level has no keys yet they are held until the
//! keys are announced.

use super::{request_frames, FrameProducer, SenderCommand, SharedConnection, Shutdown};
use crate::topics::{SentPacket, Topics};
use bytes::Bytes;
use qprobe_quic::{
    AckFrame, DirectionalEncryptionLevel, EncodedPacket, EncryptionLevel, Frame, KeyDirection,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Packets built per level in one flush before yielding to other events
pub const MAX_PACKETS_PER_FLUSH: usize = 64;

/// Sources the sender pulls frames from
#[derive(Debug, Clone)]
pub struct Producers {
    pub queue: FrameProducer,
    pub streams: FrameProducer,
    pub flow_control: FrameProducer,
}

pub struct SenderAgent {
    core: SenderCore,
    commands: mpsc::Receiver<SenderCommand>,
    levels: mpsc::Receiver<DirectionalEncryptionLevel>,
    shutdown: Shutdown,
}

struct SenderCore {
    conn: SharedConnection,
    topics: Topics,
    producers: Producers,
    outgoing: mpsc::Sender<Bytes>,
    mtu: usize,
    delay: Duration,
    pending: usize,
    deadline: Option<Instant>,
    /// Whole packets waiting for keys
    held: Vec<(EncryptionLevel, Vec<Frame>)>,
    /// Frames pulled but left out of an overfull packet
    carry: BTreeMap<EncryptionLevel, Vec<Frame>>,
}

impl SenderAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: SharedConnection,
        topics: Topics,
        producers: Producers,
        commands: mpsc::Receiver<SenderCommand>,
        outgoing: mpsc::Sender<Bytes>,
        mtu: usize,
        delay: Duration,
        shutdown: Shutdown,
    ) -> Self {
        let levels = topics.encryption_levels.subscribe();
        Self {
            core: SenderCore {
                conn,
                topics,
                producers,
                outgoing,
                mtu,
                delay,
                pending: 0,
                deadline: None,
                held: Vec::new(),
                carry: BTreeMap::new(),
            },
            commands,
            levels,
            shutdown,
        }
    }

    pub async fn run(self) {
        let Self {
            mut core,
            mut commands,
            mut levels,
            mut shutdown,
        } = self;

        loop {
            let deadline = core.deadline;
            select! {
                _ = shutdown.recv() => break,

                command = commands.recv() => match command {
                    Some(SenderCommand::Prepare { level, bytes }) => core.on_prepare(level, bytes).await,
                    Some(SenderCommand::Send { level, frames }) => core.send_whole(level, frames).await,
                    None => break,
                },

                event = levels.recv() => match event {
                    Some(event) => {
                        if event.direction == KeyDirection::Write && event.available {
                            trace!(level = ?event.level, "write keys announced");
                            core.release_held().await;
                            core.flush().await;
                        }
                    }
                    None => break,
                },

                _ = super::sleep_until(deadline) => {
                    core.flush().await;
                }
            }
        }

        debug!(held = core.held.len(), "sender stopped");
    }
}

impl SenderCore {
    async fn on_prepare(&mut self, level: EncryptionLevel, bytes: usize) {
        self.pending += bytes;
        trace!(?level, bytes, pending = self.pending, "prepare");
        if self.pending >= self.mtu {
            self.flush().await;
        } else if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.delay);
        }
    }

    /// Drain every producer into packets
    async fn flush(&mut self) {
        self.pending = 0;
        self.deadline = None;
        for level in EncryptionLevel::REAL {
            let mut sent = 0;
            while sent < MAX_PACKETS_PER_FLUSH && self.send_next(level).await {
                sent += 1;
            }
            if sent == MAX_PACKETS_PER_FLUSH {
                // Come back after other events had a chance
                self.deadline = Some(Instant::now());
            }
        }
    }

    /// Assemble and send one packet at `level`; false when there was nothing
    /// to send
    async fn send_next(&mut self, level: EncryptionLevel) -> bool {
        let (budget, best, best_app_data) = {
            let conn = self.conn.lock();
            let states = conn.crypto_states();
            if !states.is_available(level, KeyDirection::Write) {
                return false;
            }
            match conn.packet_budget(level, self.mtu) {
                Ok(budget) => (
                    budget,
                    states.resolve(EncryptionLevel::Best, KeyDirection::Write) == Some(level),
                    states.resolve(EncryptionLevel::BestAppData, KeyDirection::Write)
                        == Some(level),
                ),
                Err(e) => {
                    debug!(?level, error = %e, "no packet budget");
                    return false;
                }
            }
        };

        let mut frames = self.carry.remove(&level).unwrap_or_default();
        let mut available =
            budget.saturating_sub(frames.iter().map(Frame::wire_len).sum::<usize>());

        let mut sources: Vec<(&FrameProducer, EncryptionLevel)> =
            vec![(&self.producers.queue, level)];
        if best {
            sources.push((&self.producers.queue, EncryptionLevel::Best));
        }
        if best_app_data {
            sources.push((&self.producers.queue, EncryptionLevel::BestAppData));
            sources.push((&self.producers.streams, EncryptionLevel::BestAppData));
        }
        if level.carries_app_data() {
            sources.push((&self.producers.flow_control, level));
        }

        for (producer, queried) in sources {
            if available == 0 {
                break;
            }
            for frame in request_frames(producer, queried, available, frames.is_empty()).await {
                available = available.saturating_sub(frame.wire_len());
                frames.push(frame);
            }
        }

        if frames.is_empty() {
            return false;
        }

        let mut frames = merge_acks(frames);
        frames.sort_by_key(Frame::priority);
        let mut size: usize = frames.iter().map(Frame::wire_len).sum();
        while size > budget && frames.len() > 1 {
            if let Some(frame) = frames.pop() {
                size -= frame.wire_len();
                self.carry.entry(level).or_default().push(frame);
            }
        }

        self.emit(level, frames).await
    }

    /// Send frames exactly as given, holding them until keys exist
    async fn send_whole(&mut self, level: EncryptionLevel, frames: Vec<Frame>) {
        let resolved = self
            .conn
            .lock()
            .crypto_states()
            .resolve(level, KeyDirection::Write);
        match resolved {
            Some(real) => {
                self.emit(real, frames).await;
            }
            None => {
                debug!(?level, frames = frames.len(), "holding packet until keys are installed");
                self.held.push((level, frames));
            }
        }
    }

    async fn release_held(&mut self) {
        for (level, frames) in std::mem::take(&mut self.held) {
            self.send_whole(level, frames).await;
        }
    }

    async fn emit(&mut self, level: EncryptionLevel, frames: Vec<Frame>) -> bool {
        let sent_at = super::now();
        let encoded = self.conn.lock().encode_packet(level, frames);
        let EncodedPacket { packet, datagram } = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(?level, error = %e, "failed to encode packet");
                return false;
            }
        };

        let size = datagram.len();
        trace!(
            ?level,
            packet_number = packet.packet_number,
            frames = packet.frames.len(),
            size,
            "sending packet"
        );
        if self.outgoing.send(datagram).await.is_err() {
            debug!("outgoing channel closed");
            return false;
        }
        self.topics
            .packets_out
            .publish(SentPacket {
                packet: Arc::new(packet),
                sent_at,
                size,
            })
            .await;
        true
    }
}

/// Fold every ACK frame of a packet into one
pub fn merge_acks(frames: Vec<Frame>) -> Vec<Frame> {
    let mut merged: Option<AckFrame> = None;
    let mut out = Vec::with_capacity(frames.len());
    for frame in frames {
        match frame {
            Frame::Ack(ack) => {
                merged = Some(match merged {
                    None => ack,
                    Some(previous) => match previous.merge(&ack) {
                        Ok(m) => m,
                        Err(e) => {
                            debug!(error = %e, "keeping the newer ACK frame");
                            ack
                        }
                    },
                });
            }
            other => out.push(other),
        }
    }
    if let Some(ack) = merged {
        out.push(Frame::Ack(ack));
    }
    out
}
