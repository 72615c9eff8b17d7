//! Receive window updates.
//!
//! The engine raises our limits as stream data is consumed; this agent
//! hands the resulting MAX_DATA / MAX_STREAM_DATA frames to the sender and
//! wakes it whenever new stream data may have moved a window.

use super::{FrameRequest, SenderHandle, SharedConnection, Shutdown};
use qprobe_quic::{EncryptionLevel, KeyDirection, StreamDelivery};
use tokio::select;
use tokio::sync::mpsc;
use tracing::trace;

pub struct FlowControlAgent {
    conn: SharedConnection,
    sender: SenderHandle,
    requests: mpsc::Receiver<FrameRequest>,
    deliveries: mpsc::Receiver<StreamDelivery>,
    shutdown: Shutdown,
}

impl FlowControlAgent {
    pub fn new(
        conn: SharedConnection,
        sender: SenderHandle,
        requests: mpsc::Receiver<FrameRequest>,
        deliveries: mpsc::Receiver<StreamDelivery>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            conn,
            sender,
            requests,
            deliveries,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            select! {
                _ = self.shutdown.recv() => break,

                request = self.requests.recv() => match request {
                    Some(request) => {
                        let frames = {
                            let mut conn = self.conn.lock();
                            let level = if request.level.is_virtual() {
                                conn.crypto_states().resolve(request.level, KeyDirection::Write)
                            } else {
                                Some(request.level)
                            };
                            level.map_or_else(Vec::new, |level| {
                                conn.flow_control_frames(level, request.available)
                            })
                        };
                        if !frames.is_empty() {
                            trace!(frames = frames.len(), "window updates");
                        }
                        let _ = request.reply.send(frames);
                    }
                    None => break,
                },

                delivery = self.deliveries.recv() => match delivery {
                    Some(_) => self.sender.prepare(EncryptionLevel::BestAppData, 0),
                    None => break,
                },
            }
        }
    }
}
