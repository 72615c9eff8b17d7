//! Packets that arrived before their keys.
//!
//! Handshake and 1-RTT packets routinely overtake the CRYPTO data that
//! unlocks them. They are parked per level and decoded again once read
//! keys for that level are announced.

use super::parser::Dispatcher;
use super::{SharedConnection, Shutdown};
use crate::topics::{BufferedPacket, Topics};
use bytes::Bytes;
use qprobe_quic::{Decoded, DirectionalEncryptionLevel, EncryptionLevel, KeyDirection};
use std::collections::{BTreeMap, VecDeque};
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Packets kept per level; the oldest are dropped beyond this
pub const MAX_BUFFERED_PER_LEVEL: usize = 64;

pub struct BufferAgent {
    conn: SharedConnection,
    dispatcher: Dispatcher,
    undecryptable: mpsc::Receiver<BufferedPacket>,
    levels: mpsc::Receiver<DirectionalEncryptionLevel>,
    buffered: BTreeMap<EncryptionLevel, VecDeque<Bytes>>,
    shutdown: Shutdown,
}

impl BufferAgent {
    pub fn new(conn: SharedConnection, topics: &Topics, shutdown: Shutdown) -> Self {
        Self {
            conn,
            dispatcher: Dispatcher::new(topics.clone()),
            undecryptable: topics.undecryptable.subscribe(),
            levels: topics.encryption_levels.subscribe(),
            buffered: BTreeMap::new(),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            select! {
                _ = self.shutdown.recv() => break,

                packet = self.undecryptable.recv() => match packet {
                    Some(BufferedPacket { level, data }) => {
                        // Keys may have been installed while the packet was in flight
                        let ready = self
                            .conn
                            .lock()
                            .crypto_states()
                            .is_available(level, KeyDirection::Read);
                        if ready {
                            self.decode(data).await;
                        } else {
                            self.store(level, data);
                        }
                    }
                    None => break,
                },

                event = self.levels.recv() => match event {
                    Some(event) if event.direction == KeyDirection::Read && event.available => {
                        self.release(event.level).await;
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        let left: usize = self.buffered.values().map(VecDeque::len).sum();
        debug!(left, "buffer agent stopped");
    }

    fn store(&mut self, level: EncryptionLevel, data: Bytes) {
        let queue = self.buffered.entry(level).or_default();
        if queue.len() >= MAX_BUFFERED_PER_LEVEL {
            queue.pop_front();
            warn!(?level, "undecryptable buffer full, dropping oldest packet");
        }
        queue.push_back(data);
    }

    async fn release(&mut self, level: EncryptionLevel) {
        let Some(queue) = self.buffered.remove(&level) else {
            return;
        };
        debug!(?level, packets = queue.len(), "decoding buffered packets");
        for data in queue {
            self.decode(data).await;
        }
    }

    async fn decode(&mut self, data: Bytes) {
        let decoded = self.conn.lock().decode_buffered(data);
        match decoded {
            Decoded::Packet(packet) => self.dispatcher.publish_packet(packet).await,
            Decoded::Undecryptable { level, data } => self.store(level, data),
            Decoded::Dropped(e) => debug!(error = %e, "buffered packet dropped"),
        }
    }
}
