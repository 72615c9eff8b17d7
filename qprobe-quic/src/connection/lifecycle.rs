//! # Connection Lifecycle
//!
//! ```text
//! Created -> Negotiating(v) -> Handshaking -> Established -> Closing -> Closed
//!                 ^                 |
//!                 +-----------------+  (Version Negotiation or Retry restart)
//! ```
//!
//! `Closing` can be entered from any open state, and any state can jump to
//! `Closed` when the transport fails. `Closed` is terminal.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};

/// Connection State
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Created,

    /// Initial flight sent with this version
    Negotiating(u32),

    /// Handshake keys installed, TLS in progress
    Handshaking,

    /// Handshake complete, 1-RTT keys installed
    Established,

    /// Close frame sent or received
    Closing,

    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Created => "created",
            ConnectionState::Negotiating(_) => "negotiating",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Established => "established",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }

    /// Whether `to` can follow this state
    pub fn can_transition_to(&self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, to) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Closing, _) => false,
            (_, Closing) => true,
            (Created | Negotiating(_) | Handshaking, Negotiating(_)) => true,
            (Negotiating(_), Handshaking) => true,
            (Negotiating(_) | Handshaking, Established) => true,
            _ => false,
        }
    }

    /// New work is refused once the connection is closed
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl core::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConnectionState::Negotiating(v) => write!(f, "negotiating(0x{v:08x})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Guarded holder of the current state
#[derive(Debug, Clone, Copy, Default)]
pub struct Lifecycle {
    state: ConnectionState,
}

impl Lifecycle {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `to`, or fail without changing state
    pub fn transition(&mut self, to: ConnectionState) -> Result<ConnectionState> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                from: self.state.name(),
                to: to.name(),
            });
        }
        let from = self.state;
        self.state = to;
        tracing::debug!(%from, to = %self.state, "connection state changed");
        Ok(from)
    }
}
