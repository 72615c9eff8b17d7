//! Outbound stream data.
//!
//! Application writes reserve connection and stream credit, take their
//! stream offsets and wait in [`SendBuffers`] until the sender pulls them
//! as STREAM frames. Bytes without credit wait in a blocked queue, in
//! write order per stream, and are retried when the peer raises a limit or
//! the handshake completes. Blocking signals and stream control frames
//! (FIN-only, RESET_STREAM, STOP_SENDING) are handed out with the data.

use super::{FrameRequest, SenderHandle, SharedConnection, Shutdown};
use crate::topics::HandshakeStatus;
use bytes::Bytes;
use qprobe_quic::{EncryptionLevel, Frame, Packet, SendBuffers, StreamId};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Input of the stream agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    /// Queue `data`; `close` ends the stream after it
    Write {
        stream_id: StreamId,
        data: Bytes,
        close: bool,
    },
    Reset { stream_id: StreamId, error_code: u16 },
    StopSending { stream_id: StreamId, error_code: u16 },
}

#[derive(Debug, Clone)]
struct BlockedWrite {
    stream_id: StreamId,
    data: Bytes,
    close: bool,
}

pub struct StreamAgent {
    core: StreamCore,
    commands: mpsc::Receiver<StreamCommand>,
    requests: mpsc::Receiver<FrameRequest>,
    packets: mpsc::Receiver<Arc<Packet>>,
    status: mpsc::Receiver<HandshakeStatus>,
    shutdown: Shutdown,
}

struct StreamCore {
    conn: SharedConnection,
    sender: SenderHandle,
    buffers: SendBuffers,
    blocked: VecDeque<BlockedWrite>,
    /// Control frames handed out ahead of stream data
    control: VecDeque<Frame>,
}

impl StreamAgent {
    pub fn new(
        conn: SharedConnection,
        sender: SenderHandle,
        commands: mpsc::Receiver<StreamCommand>,
        requests: mpsc::Receiver<FrameRequest>,
        packets: mpsc::Receiver<Arc<Packet>>,
        status: mpsc::Receiver<HandshakeStatus>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            core: StreamCore {
                conn,
                sender,
                buffers: SendBuffers::new(),
                blocked: VecDeque::new(),
                control: VecDeque::new(),
            },
            commands,
            requests,
            packets,
            status,
            shutdown,
        }
    }

    pub async fn run(self) {
        let Self {
            mut core,
            mut commands,
            mut requests,
            mut packets,
            mut status,
            mut shutdown,
        } = self;

        loop {
            select! {
                _ = shutdown.recv() => break,

                command = commands.recv() => match command {
                    Some(command) => core.on_command(command),
                    None => break,
                },

                request = requests.recv() => match request {
                    Some(request) => core.on_request(request),
                    None => break,
                },

                packet = packets.recv() => match packet {
                    Some(packet) => {
                        if raises_limits(&packet) {
                            core.retry_blocked();
                        }
                    }
                    None => break,
                },

                event = status.recv() => match event {
                    Some(HandshakeStatus::Completed) => core.retry_blocked(),
                    Some(HandshakeStatus::Failed(_)) => {}
                    None => break,
                },
            }
        }

        debug!(blocked = core.blocked.len(), "stream agent stopped");
    }
}

impl StreamCore {
    fn on_command(&mut self, command: StreamCommand) {
        match command {
            StreamCommand::Write {
                stream_id,
                data,
                close,
            } => self.on_write(BlockedWrite {
                stream_id,
                data,
                close,
            }),
            StreamCommand::Reset {
                stream_id,
                error_code,
            } => {
                self.discard(stream_id);
                let frame = self.conn.lock().reset_stream(stream_id, error_code);
                self.queue_control(stream_id, frame);
            }
            StreamCommand::StopSending {
                stream_id,
                error_code,
            } => {
                let frame = self.conn.lock().stop_sending(stream_id, error_code);
                self.queue_control(stream_id, frame);
            }
        }
    }

    fn on_write(&mut self, write: BlockedWrite) {
        // Keep byte order behind earlier blocked writes of the stream
        if let Some(last) = self
            .blocked
            .iter_mut()
            .rev()
            .find(|b| b.stream_id == write.stream_id)
        {
            if write.data.is_empty() {
                last.close |= write.close;
            } else {
                self.blocked.push_back(write);
            }
            return;
        }

        if write.data.is_empty() && write.close && self.buffers.pending(write.stream_id) == 0 {
            let frame = self.conn.lock().close_stream(write.stream_id);
            self.queue_control(write.stream_id, frame);
            return;
        }

        if let Some(rest) = self.try_write(write) {
            self.blocked.push_back(rest);
        }
    }

    /// Write as much as credit allows; returns what is left
    fn try_write(&mut self, write: BlockedWrite) -> Option<BlockedWrite> {
        let BlockedWrite {
            stream_id,
            data,
            close,
        } = write;

        let (reserved, offset, signals) = {
            let mut conn = self.conn.lock();
            let reservation = conn.reserve_credit(stream_id, data.len() as u64, true);
            let reserved = (reservation.reserved as usize).min(data.len());
            let finishes = reserved == data.len();
            match conn.stream_write(stream_id, reserved, close && finishes) {
                Ok(offset) => (reserved, offset, reservation.signals),
                Err(e) => {
                    warn!(stream = stream_id.value(), error = %e, "dropping write");
                    return None;
                }
            }
        };

        for signal in signals {
            trace!(frame = signal.name(), "blocked signal");
            self.control.push_back(signal);
        }

        let finishes = reserved == data.len();
        if reserved > 0 || (finishes && close) {
            self.buffers
                .push(stream_id, offset, &data[..reserved], close && finishes);
            self.sender
                .prepare(EncryptionLevel::BestAppData, reserved.max(1));
        } else if !self.control.is_empty() {
            self.sender.prepare(EncryptionLevel::BestAppData, 1);
        }

        if finishes {
            None
        } else {
            debug!(
                stream = stream_id.value(),
                reserved,
                remaining = data.len() - reserved,
                "write blocked by flow control"
            );
            Some(BlockedWrite {
                stream_id,
                data: data.slice(reserved..),
                close,
            })
        }
    }

    /// Retry blocked writes in order, stopping per stream at the first
    /// that still lacks credit
    fn retry_blocked(&mut self) {
        if self.blocked.is_empty() {
            return;
        }
        let mut still_blocked = VecDeque::new();
        let mut stuck: HashSet<StreamId> = HashSet::new();
        for write in std::mem::take(&mut self.blocked) {
            if stuck.contains(&write.stream_id) {
                still_blocked.push_back(write);
                continue;
            }
            if let Some(rest) = self.try_write(write) {
                stuck.insert(rest.stream_id);
                still_blocked.push_back(rest);
            }
        }
        self.blocked = still_blocked;
    }

    fn discard(&mut self, stream_id: StreamId) {
        self.blocked.retain(|b| b.stream_id != stream_id);
        let pending = self.buffers.discard(stream_id);
        if pending > 0 {
            debug!(stream = stream_id.value(), pending, "discarded unsent data");
        }
    }

    fn queue_control(&mut self, stream_id: StreamId, frame: qprobe_quic::Result<Frame>) {
        match frame {
            Ok(frame) => {
                let bytes = frame.wire_len();
                self.control.push_back(frame);
                self.sender.prepare(EncryptionLevel::BestAppData, bytes);
            }
            Err(e) => warn!(stream = stream_id.value(), error = %e, "stream operation rejected"),
        }
    }

    fn on_request(&mut self, request: FrameRequest) {
        let mut frames = Vec::new();
        if request.level.carries_app_data() {
            let mut available = request.available;
            while let Some(frame) = self.control.front() {
                let len = frame.wire_len();
                if len > available {
                    break;
                }
                available -= len;
                if let Some(frame) = self.control.pop_front() {
                    frames.push(frame);
                }
            }
            frames.extend(self.buffers.next_frames(available).into_iter().map(Frame::Stream));
        }
        let _ = request.reply.send(frames);

        if !self.buffers.is_empty() || !self.control.is_empty() {
            self.sender.prepare(EncryptionLevel::BestAppData, 1);
        }
    }
}

/// Whether a packet raises one of the peer's limits
fn raises_limits(packet: &Packet) -> bool {
    packet.frames().iter().any(|f| {
        matches!(
            f,
            Frame::MaxData(_) | Frame::MaxStreamData(_) | Frame::MaxStreamId(_)
        )
    })
}
