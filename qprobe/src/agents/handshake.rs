//! TLS handshake driver.
//!
//! Feeds received CRYPTO data into the TLS session, installs every secret
//! it derives, queues its output as CRYPTO frames and applies the peer's
//! transport parameters. Completion or failure is published exactly once
//! per attempt.
//!
//! On the client, a Version Negotiation or Retry packet restarts the
//! attempt: the TLS session is reset and a fresh first flight is sent with
//! the new version or destination id.

use super::{FrameQueueHandle, SharedConnection, Shutdown};
use crate::topics::{CryptoData, HandshakeStatus, Topics};
use bytes::Bytes;
use qprobe_quic::frames::CryptoFrame;
use qprobe_quic::version::NegotiationState;
use qprobe_quic::{
    ConnectionState, EncryptionLevel, Frame, KeyDirection, Packet, Side, TlsSession,
};
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Levels whose secrets come from TLS
const TLS_LEVELS: [EncryptionLevel; 3] = [
    EncryptionLevel::ZeroRtt,
    EncryptionLevel::Handshake,
    EncryptionLevel::OneRtt,
];

/// Largest CRYPTO frame payload for a given MTU
///
/// Leaves room for the longest long header, including a Retry token.
pub fn crypto_chunk_size(mtu: usize) -> usize {
    (mtu * 3 / 4).max(256)
}

pub struct HandshakeAgent {
    conn: SharedConnection,
    tls: Box<dyn TlsSession>,
    topics: Topics,
    queue: FrameQueueHandle,
    crypto: mpsc::Receiver<CryptoData>,
    packets: mpsc::Receiver<Arc<Packet>>,
    chunk_size: usize,
    installed: Vec<(EncryptionLevel, KeyDirection)>,
    peer_parameters_applied: bool,
    completed: bool,
    failed: bool,
    last_state: ConnectionState,
    shutdown: Shutdown,
}

impl HandshakeAgent {
    pub fn new(
        conn: SharedConnection,
        tls: Box<dyn TlsSession>,
        topics: Topics,
        queue: FrameQueueHandle,
        mtu: usize,
        shutdown: Shutdown,
    ) -> Self {
        let crypto = topics.crypto_data.subscribe();
        let packets = topics.packets_in.subscribe();
        let last_state = conn.lock().state();
        Self {
            conn,
            tls,
            topics,
            queue,
            crypto,
            packets,
            chunk_size: crypto_chunk_size(mtu),
            installed: Vec::new(),
            peer_parameters_applied: false,
            completed: false,
            failed: false,
            last_state,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        self.start().await;

        loop {
            select! {
                _ = self.shutdown.recv() => break,

                data = self.crypto.recv() => match data {
                    Some(CryptoData { level, data }) => self.feed(&data, level).await,
                    None => break,
                },

                packet = self.packets.recv() => match packet {
                    Some(packet) => self.on_packet(&packet).await,
                    None => break,
                },
            }
        }

        debug!(completed = self.completed, failed = self.failed, "handshake agent stopped");
    }

    /// Hand our transport parameters to TLS and, as client, send the
    /// first flight
    async fn start(&mut self) {
        let (side, parameters) = {
            let conn = self.conn.lock();
            (conn.side(), conn.local_transport_parameters())
        };
        let parameters = match parameters {
            Ok(p) => p,
            Err(e) => return self.fail(format!("encoding transport parameters: {}", e)).await,
        };
        if let Err(e) = self.tls.set_transport_parameters(&parameters) {
            return self.fail(format!("TLS rejected transport parameters: {}", e)).await;
        }
        if side == Side::Client {
            self.feed(&[], EncryptionLevel::Initial).await;
        }
    }

    async fn feed(&mut self, data: &[u8], level: EncryptionLevel) {
        if self.failed {
            return;
        }

        let output = match self.tls.handle_message(data, level) {
            Ok(output) => output,
            Err(e) => return self.fail(format!("TLS: {}", e)).await,
        };

        if let Err(reason) = self.install_secrets().await {
            return self.fail(reason).await;
        }

        if !self.peer_parameters_applied {
            if let Some(encoded) = self.tls.peer_transport_parameters() {
                let applied = self
                    .conn
                    .lock()
                    .on_peer_transport_parameters(&encoded)
                    .map(|p| p.idle_timeout);
                match applied {
                    Ok(idle_timeout) => {
                        debug!(idle_timeout, "peer transport parameters applied");
                        self.peer_parameters_applied = true;
                    }
                    Err(e) => {
                        return self
                            .fail(format!("invalid peer transport parameters: {}", e))
                            .await
                    }
                }
            }
        }

        for message in output.messages {
            if let Err(e) = self.queue_crypto(message.level, message.data).await {
                return self.fail(format!("queuing handshake data: {}", e)).await;
            }
        }

        if !output.in_progress && !self.completed {
            let completion = self.conn.lock().on_handshake_complete();
            if let Err(e) = completion {
                return self.fail(format!("completing handshake: {}", e)).await;
            }
            self.completed = true;
            info!(alpn = ?self.tls.alpn(), "handshake complete");
            self.topics
                .handshake_status
                .publish(HandshakeStatus::Completed)
                .await;
        }
        self.publish_state().await;
    }

    /// Install every secret TLS derived since the last call
    async fn install_secrets(&mut self) -> Result<(), String> {
        let mut announced = Vec::new();
        for level in TLS_LEVELS {
            for direction in [KeyDirection::Read, KeyDirection::Write] {
                if self.installed.contains(&(level, direction)) {
                    continue;
                }
                let secret = match direction {
                    KeyDirection::Read => self.tls.read_secret(level),
                    KeyDirection::Write => self.tls.write_secret(level),
                };
                let Some(secret) = secret else {
                    continue;
                };
                let event = self
                    .conn
                    .lock()
                    .install_keys(level, direction, &secret)
                    .map_err(|e| format!("installing {:?} {:?} keys: {}", level, direction, e))?;
                self.installed.push((level, direction));
                announced.push(event);
            }
        }

        for event in announced {
            debug!(level = ?event.level, direction = ?event.direction, "keys installed");
            self.topics.encryption_levels.publish(event).await;
        }
        Ok(())
    }

    async fn queue_crypto(&mut self, level: EncryptionLevel, data: Bytes) -> qprobe_quic::Result<()> {
        let mut start = 0;
        while start < data.len() {
            let end = (start + self.chunk_size).min(data.len());
            let offset = self.conn.lock().crypto_write(level, end - start)?;
            let frame = Frame::Crypto(CryptoFrame {
                offset,
                data: data.slice(start..end),
            });
            self.queue.push(level, frame).await;
            start = end;
        }
        Ok(())
    }

    async fn on_packet(&mut self, packet: &Packet) {
        if self.failed || self.conn.lock().side() != Side::Client {
            return;
        }
        match packet {
            Packet::VersionNegotiation { header, .. } => {
                let outcome = {
                    let mut conn = self.conn.lock();
                    let first = conn.negotiation() == NegotiationState::NotNegotiated;
                    conn.process_version_negotiation(header).map(|v| (first, v))
                };
                match outcome {
                    Ok((true, version)) => {
                        info!(
                            version = format_args!("0x{:08x}", version),
                            offered = ?header.supported_versions,
                            "restarting after version negotiation"
                        );
                        self.restart().await;
                    }
                    Ok((false, _)) => {}
                    Err(e) => self.fail(format!("version negotiation failed: {}", e)).await,
                }
            }
            Packet::Retry { header, .. } => {
                let outcome = self.conn.lock().process_retry(header);
                match outcome {
                    Ok(true) => {
                        info!(scid = %header.scid, token_len = header.token.len(), "restarting after retry");
                        self.restart().await;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "ignoring retry"),
                }
            }
            Packet::Framed(_) => {}
        }
    }

    async fn restart(&mut self) {
        if let Err(e) = self.tls.reset() {
            return self.fail(format!("resetting TLS: {}", e)).await;
        }
        self.installed.clear();
        self.peer_parameters_applied = false;
        self.completed = false;
        self.queue.clear().await;
        self.publish_state().await;
        self.start().await;
    }

    async fn fail(&mut self, reason: String) {
        if self.failed {
            return;
        }
        self.failed = true;
        error!(%reason, "handshake failed");
        self.topics
            .handshake_status
            .publish(HandshakeStatus::Failed(reason))
            .await;
        self.conn.lock().on_closed();
        self.publish_state().await;
    }

    async fn publish_state(&mut self) {
        let state = self.conn.lock().state();
        if state != self.last_state {
            debug!(from = self.last_state.name(), to = state.name(), "connection state");
            self.last_state = state;
            self.topics.connection_state.publish(state).await;
        }
    }
}
