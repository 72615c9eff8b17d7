//! Typed publish/subscribe topics between agents.
//!
//! A [`Topic`] fans every published value out to all of its subscribers.
//! Each subscriber owns a bounded queue: a publisher waits while any live
//! subscriber's queue is full, so a slow agent slows the pipeline down
//! instead of losing events or growing memory. Subscribers that went away
//! are pruned on the next publish.
//!
//! [`Topics`] is the registry of every event category the pipeline carries,
//! one strongly typed topic per category.

use bytes::Bytes;
use parking_lot::Mutex;
use qprobe_quic::connection::{ConnectionState, StreamDelivery};
use qprobe_quic::crypto::{DirectionalEncryptionLevel, EncryptionLevel};
use qprobe_quic::error::ProtocolViolation;
use qprobe_quic::packet::{FramedPacket, Packet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// One event category with any number of subscribers
pub struct Topic<T> {
    name: &'static str,
    capacity: usize,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<T>>>>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            capacity: self.capacity,
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<T> std::fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Topic<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register a new subscriber; it only sees values published afterwards
    pub fn subscribe(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver `value` to every subscriber, waiting for queue space
    ///
    /// Returns the number of subscribers reached.
    pub async fn publish(&self, value: T) -> usize {
        let subscribers: Vec<mpsc::Sender<T>> = self.subscribers.lock().clone();
        let mut delivered = 0;
        let mut closed = false;
        for tx in &subscribers {
            if tx.send(value.clone()).await.is_ok() {
                delivered += 1;
            } else {
                closed = true;
            }
        }
        if closed {
            self.subscribers.lock().retain(|tx| !tx.is_closed());
            tracing::trace!(topic = self.name, "pruned closed subscribers");
        }
        delivered
    }
}

/// Undecryptable ciphertext waiting for read keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedPacket {
    pub level: EncryptionLevel,
    pub data: Bytes,
}

/// A packet handed to the socket
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub packet: Arc<FramedPacket>,
    pub sent_at: Instant,
    pub size: usize,
}

/// Handshake bytes decoded at one level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoData {
    pub level: EncryptionLevel,
    pub data: Bytes,
}

/// Terminal outcome of the TLS handshake, broadcast exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    Completed,
    Failed(String),
}

/// Every event category flowing between agents
#[derive(Debug, Clone)]
pub struct Topics {
    /// Raw datagrams read from the socket
    pub datagrams_in: Topic<Bytes>,
    /// Packets decoded and applied to the connection
    pub packets_in: Topic<Arc<Packet>>,
    /// Packets sealed and written to the socket
    pub packets_out: Topic<SentPacket>,
    pub undecryptable: Topic<BufferedPacket>,
    pub crypto_data: Topic<CryptoData>,
    pub stream_data: Topic<StreamDelivery>,
    pub encryption_levels: Topic<DirectionalEncryptionLevel>,
    pub violations: Topic<ProtocolViolation>,
    pub handshake_status: Topic<HandshakeStatus>,
    pub connection_state: Topic<ConnectionState>,
}

impl Topics {
    pub fn new(capacity: usize) -> Self {
        Self {
            datagrams_in: Topic::new("datagrams_in", capacity),
            packets_in: Topic::new("packets_in", capacity),
            packets_out: Topic::new("packets_out", capacity),
            undecryptable: Topic::new("undecryptable", capacity),
            crypto_data: Topic::new("crypto_data", capacity),
            stream_data: Topic::new("stream_data", capacity),
            encryption_levels: Topic::new("encryption_levels", capacity),
            violations: Topic::new("violations", capacity),
            handshake_status: Topic::new("handshake_status", capacity),
            connection_state: Topic::new("connection_state", capacity),
        }
    }
}
