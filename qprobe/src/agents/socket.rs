//! UDP transport of a pipeline.
//!
//! Publishes every received datagram and writes every outgoing one on a
//! connected socket. A socket error ends the attempt.

use super::{SharedConnection, Shutdown, ShutdownTrigger};
use crate::topics::Topics;
use bytes::Bytes;
use qprobe_quic::types::MAX_UDP_PAYLOAD_SIZE;
use qprobe_quic::ConnectionState;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

pub struct SocketAgent {
    socket: UdpSocket,
    outgoing: mpsc::Receiver<Bytes>,
    conn: SharedConnection,
    topics: Topics,
    trigger: ShutdownTrigger,
    shutdown: Shutdown,
}

impl SocketAgent {
    pub fn new(
        socket: UdpSocket,
        outgoing: mpsc::Receiver<Bytes>,
        conn: SharedConnection,
        topics: Topics,
        trigger: ShutdownTrigger,
    ) -> Self {
        let shutdown = trigger.subscribe();
        Self {
            socket,
            outgoing,
            conn,
            topics,
            trigger,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD_SIZE];
        let mut received = 0u64;
        let mut sent = 0u64;

        let failed = loop {
            select! {
                _ = self.shutdown.recv() => break false,

                result = self.socket.recv(&mut buf) => match result {
                    Ok(len) => {
                        received += 1;
                        trace!(len, "datagram in");
                        self.topics
                            .datagrams_in
                            .publish(Bytes::copy_from_slice(&buf[..len]))
                            .await;
                    }
                    Err(e) => {
                        error!(error = %e, "UDP receive failed");
                        break true;
                    }
                },

                datagram = self.outgoing.recv() => match datagram {
                    Some(datagram) => {
                        if let Err(e) = self.socket.send(&datagram).await {
                            error!(error = %e, len = datagram.len(), "UDP send failed");
                            break true;
                        }
                        sent += 1;
                        trace!(len = datagram.len(), "datagram out");
                    }
                    None => break false,
                },
            }
        };

        debug!(received, sent, "socket agent stopped");
        if failed {
            self.conn.lock().on_closed();
            self.topics
                .connection_state
                .publish(ConnectionState::Closed)
                .await;
            self.trigger.fire();
        }
    }
}
