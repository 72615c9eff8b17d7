//! Datagram decoding.
//!
//! Splits each received datagram into packets and publishes what the
//! engine made of them. Packets whose keys are missing go to the
//! undecryptable topic for the buffer agent.

use super::{SharedConnection, Shutdown};
use crate::topics::{BufferedPacket, CryptoData, Topics};
use bytes::Bytes;
use qprobe_quic::{Decoded, DecodedPacket};
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Publishes the content of decoded packets to their topics
#[derive(Debug, Clone)]
pub struct Dispatcher {
    topics: Topics,
}

impl Dispatcher {
    pub fn new(topics: Topics) -> Self {
        Self { topics }
    }

    pub async fn publish_packet(&self, decoded: DecodedPacket) {
        let DecodedPacket { packet, delivery } = decoded;

        for (level, data) in delivery.crypto {
            self.topics
                .crypto_data
                .publish(CryptoData { level, data })
                .await;
        }
        for stream in delivery.streams {
            trace!(
                stream = stream.stream_id.value(),
                len = stream.data.len(),
                finished = stream.finished,
                "stream data"
            );
            self.topics.stream_data.publish(stream).await;
        }
        for violation in delivery.violations {
            warn!(?violation, "protocol violation");
            self.topics.violations.publish(violation).await;
        }
        if delivery.peer_closed {
            info!("peer closed the connection");
        }

        self.topics.packets_in.publish(Arc::new(packet)).await;
    }
}

pub struct ParserAgent {
    conn: SharedConnection,
    dispatcher: Dispatcher,
    topics: Topics,
    datagrams: mpsc::Receiver<Bytes>,
    shutdown: Shutdown,
}

impl ParserAgent {
    pub fn new(conn: SharedConnection, topics: Topics, shutdown: Shutdown) -> Self {
        let datagrams = topics.datagrams_in.subscribe();
        Self {
            conn,
            dispatcher: Dispatcher::new(topics.clone()),
            topics,
            datagrams,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            select! {
                _ = self.shutdown.recv() => break,
                datagram = self.datagrams.recv() => match datagram {
                    Some(datagram) => self.on_datagram(datagram).await,
                    None => break,
                },
            }
        }
    }

    async fn on_datagram(&mut self, datagram: Bytes) {
        trace!(len = datagram.len(), "datagram received");
        let results = self.conn.lock().decode_datagram(datagram);
        for result in results {
            match result {
                Decoded::Packet(packet) => self.dispatcher.publish_packet(packet).await,
                Decoded::Undecryptable { level, data } => {
                    debug!(?level, len = data.len(), "keys missing, buffering packet");
                    self.topics
                        .undecryptable
                        .publish(BufferedPacket { level, data })
                        .await;
                }
                Decoded::Dropped(e) => debug!(error = %e, "packet dropped"),
            }
        }
    }
}
