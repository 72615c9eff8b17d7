//! Concurrent agents driving one connection attempt.
//!
//! Each agent is a tokio task owning its state and looping over a
//! `tokio::select!` of its inputs. Agents talk through three kinds of
//! channels:
//!
//! - **Topics** ([`crate::topics`]): fan-out events such as received
//!   packets, installed keys or handshake progress.
//! - **Commands**: one-consumer queues into the frame queue, the sender and
//!   the stream agent.
//! - **Frame requests**: the sender pulls frames from its producers with a
//!   [`FrameRequest`] carrying a oneshot reply, so a packet is filled in a
//!   single round over the producers.
//!
//! ```text
//!  socket ─► datagrams_in ─► parser ─► packets_in ──► ack, rtt, recovery,
//!                              │                      handshake, stream, closing
//!                              └─► undecryptable ─► buffer (retries on new keys)
//!
//!  handshake, ack, recovery ─► frame queue ─┐
//!                       stream, flow control ├─► sender ─► socket
//!                                            └─ packets_out ─► rtt, recovery
//! ```
//!
//! The connection itself is shared behind a mutex that is never held across
//! an await point.

pub mod ack;
pub mod buffer;
pub mod closing;
pub mod flow_control;
pub mod frame_queue;
pub mod handshake;
pub mod parser;
pub mod pipeline;
pub mod recovery;
pub mod rtt;
pub mod sender;
pub mod socket;
pub mod stream;

pub use pipeline::{Pipeline, PipelineError};
pub use rtt::RttSnapshot;

use parking_lot::Mutex;
use qprobe_quic::{Connection, EncryptionLevel, Frame};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::trace;

/// Connection state shared by every agent of a pipeline
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Current time as the engine's clock type
///
/// Goes through the tokio clock so paused-time tests stay deterministic.
pub(crate) fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

// ============================================================================
// Frame requests
// ============================================================================

/// Pull request from the sender to one frame producer
#[derive(Debug)]
pub struct FrameRequest {
    /// Level the frames are asked for; virtual levels are queried as such
    pub level: EncryptionLevel,
    /// Bytes left in the packet being assembled
    pub available: usize,
    /// Nothing has been placed in the packet yet
    pub packet_empty: bool,
    pub reply: oneshot::Sender<Vec<Frame>>,
}

pub type FrameProducer = mpsc::Sender<FrameRequest>;

/// Ask `producer` for frames; a producer that went away yields nothing
pub async fn request_frames(
    producer: &FrameProducer,
    level: EncryptionLevel,
    available: usize,
    packet_empty: bool,
) -> Vec<Frame> {
    let (reply, rx) = oneshot::channel();
    let request = FrameRequest {
        level,
        available,
        packet_empty,
        reply,
    };
    if producer.send(request).await.is_err() {
        return Vec::new();
    }
    rx.await.unwrap_or_default()
}

// ============================================================================
// Frame queue and sender handles
// ============================================================================

/// Input of the frame queue agent
#[derive(Debug, Clone)]
pub enum QueueCommand {
    Push { level: EncryptionLevel, frame: Frame },
    /// Forget every queued frame (connection restart)
    Clear,
}

/// Cloneable handle for queuing frames
#[derive(Debug, Clone)]
pub struct FrameQueueHandle {
    tx: mpsc::Sender<QueueCommand>,
}

impl FrameQueueHandle {
    pub fn new(tx: mpsc::Sender<QueueCommand>) -> Self {
        Self { tx }
    }

    /// Queue `frame` for the next packet at `level`
    ///
    /// Waits while the queue is full. Returns false once the queue agent
    /// has stopped.
    pub async fn push(&self, level: EncryptionLevel, frame: Frame) -> bool {
        self.tx
            .send(QueueCommand::Push { level, frame })
            .await
            .is_ok()
    }

    pub async fn clear(&self) -> bool {
        self.tx.send(QueueCommand::Clear).await.is_ok()
    }
}

/// Input of the sender agent
#[derive(Debug, Clone)]
pub enum SenderCommand {
    /// `bytes` of frames are waiting at `level`
    Prepare { level: EncryptionLevel, bytes: usize },
    /// Send exactly these frames as one packet
    Send {
        level: EncryptionLevel,
        frames: Vec<Frame>,
    },
}

/// Cloneable handle for waking and feeding the sender
#[derive(Debug, Clone)]
pub struct SenderHandle {
    tx: mpsc::Sender<SenderCommand>,
}

impl SenderHandle {
    pub fn new(tx: mpsc::Sender<SenderCommand>) -> Self {
        Self { tx }
    }

    /// Announce pending frames without waiting
    ///
    /// A full command queue already holds a wakeup, so the announcement is
    /// dropped.
    pub fn prepare(&self, level: EncryptionLevel, bytes: usize) {
        if let Err(e) = self.tx.try_send(SenderCommand::Prepare { level, bytes }) {
            trace!(?level, bytes, error = %e, "prepare coalesced");
        }
    }

    pub async fn send(&self, level: EncryptionLevel, frames: Vec<Frame>) -> bool {
        self.tx
            .send(SenderCommand::Send { level, frames })
            .await
            .is_ok()
    }

    /// Hand over a whole packet without waiting; the frames come back when
    /// the sender is busy or gone
    pub fn try_send(&self, level: EncryptionLevel, frames: Vec<Frame>) -> Result<(), Vec<Frame>> {
        match self.tx.try_send(SenderCommand::Send { level, frames }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(SenderCommand::Send { frames, .. }))
            | Err(mpsc::error::TrySendError::Closed(SenderCommand::Send { frames, .. })) => {
                Err(frames)
            }
            Err(_) => Err(Vec::new()),
        }
    }
}

// ============================================================================
// Shutdown
// ============================================================================

/// Fires the pipeline-wide shutdown signal
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side of the shutdown signal
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Resolves once shutdown was fired (or the trigger is gone)
    pub async fn recv(&mut self) {
        if *self.rx.borrow_and_update() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow_and_update() {
                return;
            }
        }
    }
}

/// Sleep until `deadline`, forever when there is none
pub(crate) async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests;

#[cfg(test)]
mod handle_tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_wakes_every_receiver() {
        let trigger = ShutdownTrigger::new();
        let mut a = trigger.subscribe();
        let mut b = trigger.subscribe();

        let waiter = tokio::spawn(async move { a.recv().await });
        trigger.fire();
        waiter.await.unwrap();
        // Late receivers see the fired state immediately
        b.recv().await;
        trigger.subscribe().recv().await;
        assert!(trigger.is_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_not_fired_keeps_waiting() {
        let trigger = ShutdownTrigger::new();
        let mut rx = trigger.subscribe();
        let result = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_request_from_closed_producer() {
        let (tx, rx) = mpsc::channel::<FrameRequest>(1);
        drop(rx);
        let frames = request_frames(&tx, EncryptionLevel::Initial, 1000, true).await;
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn test_try_send_returns_frames_when_full() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = SenderHandle::new(tx);
        sender.prepare(EncryptionLevel::Initial, 10);
        let rejected = sender
            .try_send(EncryptionLevel::Initial, vec![Frame::Ping])
            .unwrap_err();
        assert_eq!(rejected, vec![Frame::Ping]);
    }
}
