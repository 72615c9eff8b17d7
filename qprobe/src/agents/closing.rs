//! Connection termination.
//!
//! Watches for the three ways an attempt ends: the idle timer expiring,
//! the peer sending a close frame, or a local close. Close frames are
//! followed by a short draining period so the frame has a chance to leave
//! before the pipeline shuts down.

use super::{SharedConnection, Shutdown, ShutdownTrigger};
use crate::topics::Topics;
use qprobe_quic::{ConnectionState, Frame, Packet};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Time between entering `Closing` and shutting the pipeline down
pub const DRAINING_PERIOD: Duration = Duration::from_millis(100);

/// Idle timeout in effect: the smaller of both announced values, ignoring
/// zeros (no timeout)
pub fn effective_idle_timeout(local_secs: u64, peer_secs: Option<u64>) -> Option<Duration> {
    let timeout = match (local_secs, peer_secs.unwrap_or(0)) {
        (0, 0) => return None,
        (0, peer) => peer,
        (local, 0) => local,
        (local, peer) => local.min(peer),
    };
    Some(Duration::from_secs(timeout))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    IdleTimeout,
    Drained,
    Closed,
}

pub struct ClosingAgent {
    conn: SharedConnection,
    topics: Topics,
    packets: mpsc::Receiver<Arc<Packet>>,
    states: mpsc::Receiver<ConnectionState>,
    trigger: ShutdownTrigger,
    shutdown: Shutdown,
}

impl ClosingAgent {
    pub fn new(conn: SharedConnection, topics: Topics, trigger: ShutdownTrigger) -> Self {
        let packets = topics.packets_in.subscribe();
        let states = topics.connection_state.subscribe();
        let shutdown = trigger.subscribe();
        Self {
            conn,
            topics,
            packets,
            states,
            trigger,
            shutdown,
        }
    }

    pub async fn run(self) {
        let Self {
            conn,
            topics,
            mut packets,
            mut states,
            trigger,
            mut shutdown,
        } = self;
        let idle_timeout = |conn: &SharedConnection| {
            let conn = conn.lock();
            effective_idle_timeout(
                conn.config().transport_parameters.idle_timeout,
                conn.peer_transport_parameters().map(|p| p.idle_timeout),
            )
        };

        let mut idle_deadline = idle_timeout(&conn).map(|d| Instant::now() + d);
        let mut drain_deadline: Option<Instant> = None;

        let reason = loop {
            select! {
                _ = shutdown.recv() => break None,

                packet = packets.recv() => match packet {
                    Some(packet) => {
                        idle_deadline = idle_timeout(&conn).map(|d| Instant::now() + d);
                        let closes = packet.frames().iter().any(|f| {
                            matches!(f, Frame::ConnectionClose(_) | Frame::ApplicationClose(_))
                        });
                        if closes && drain_deadline.is_none() {
                            info!("close frame received, draining");
                            drain_deadline = Some(Instant::now() + DRAINING_PERIOD);
                        }
                    }
                    None => break None,
                },

                state = states.recv() => match state {
                    Some(ConnectionState::Closing) => {
                        if drain_deadline.is_none() {
                            debug!("closing, draining");
                            drain_deadline = Some(Instant::now() + DRAINING_PERIOD);
                        }
                    }
                    Some(ConnectionState::Closed) => break Some(CloseReason::Closed),
                    Some(_) => {}
                    None => break None,
                },

                _ = super::sleep_until(idle_deadline) => break Some(CloseReason::IdleTimeout),

                _ = super::sleep_until(drain_deadline) => break Some(CloseReason::Drained),
            }
        };

        // Our own Closed announcement must not wait on our own queue
        drop(states);
        drop(packets);

        let Some(reason) = reason else {
            return;
        };
        match reason {
            CloseReason::IdleTimeout => warn!("idle timeout, abandoning connection"),
            CloseReason::Drained => info!("connection closed"),
            CloseReason::Closed => info!("connection closed after a failure"),
        }
        if reason != CloseReason::Closed {
            conn.lock().on_closed();
            topics
                .connection_state
                .publish(ConnectionState::Closed)
                .await;
        }
        trigger.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_idle_timeout() {
        assert_eq!(effective_idle_timeout(0, None), None);
        assert_eq!(effective_idle_timeout(0, Some(0)), None);
        assert_eq!(effective_idle_timeout(30, None), Some(Duration::from_secs(30)));
        assert_eq!(effective_idle_timeout(0, Some(5)), Some(Duration::from_secs(5)));
        assert_eq!(effective_idle_timeout(30, Some(10)), Some(Duration::from_secs(10)));
        assert_eq!(effective_idle_timeout(10, Some(30)), Some(Duration::from_secs(10)));
    }
}
