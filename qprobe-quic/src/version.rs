//! # QUIC Versions and Negotiation
//!
//! Version constants, per-version Initial salts, ALPN derivation and the
//! client-side negotiation state machine.
//!
//! ## Version Negotiation Process
//!
//! 1. Client sends Initial packet with its configured version
//! 2. Server doesn't support that version and answers with Version Negotiation
//! 3. Client picks the first offered version inside its supported range
//! 4. If there is none, the attempt fails and is never retried

#![forbid(unsafe_code)]

use crate::error::{Error, Result};

// ============================================================================
// QUIC Version Constants
// ============================================================================

/// Version used in Version Negotiation packets
pub const VERSION_NEGOTIATION: u32 = 0x0000_0000;

/// QUIC Version 1
pub const VERSION_1: u32 = 0x0000_0001;

/// Draft 12
pub const DRAFT_12: u32 = 0xff00_000c;

/// Draft 13
pub const DRAFT_13: u32 = 0xff00_000d;

/// Lowest version supported by default
pub const MIN_SUPPORTED_VERSION: u32 = DRAFT_12;

/// Highest version supported by default
pub const MAX_SUPPORTED_VERSION: u32 = DRAFT_13;

/// Version used for the first Initial packet by default
pub const DEFAULT_VERSION: u32 = DRAFT_13;

/// Initial salt shared by the draft versions
const DRAFT_INITIAL_SALT: &[u8] = &[
    0x9c, 0x10, 0x8f, 0x98, 0x52, 0x0a, 0x5c, 0x5c, 0x32, 0x96, 0x8e, 0x95, 0x0e, 0x8a, 0x2c,
    0x5f, 0xe0, 0x6d, 0x6c, 0x38,
];

/// Initial salt for QUIC version 1
const V1_INITIAL_SALT: &[u8] = &[
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// Whether the version is a draft version (0xff0000NN)
pub fn is_draft(version: u32) -> bool {
    version & 0xffff_ff00 == 0xff00_0000
}

/// Reserved versions have the form 0x?a?a?a?a and force negotiation
pub fn is_reserved_version(version: u32) -> bool {
    (version & 0x0f0f_0f0f) == 0x0a0a_0a0a
}

/// Turn arbitrary bits into a reserved version
pub fn reserved_version(seed: u32) -> u32 {
    (seed & 0xf0f0_f0f0) | 0x0a0a_0a0a
}

/// Salt for Initial secret derivation
pub fn initial_salt(version: u32) -> Result<&'static [u8]> {
    if is_draft(version) {
        Ok(DRAFT_INITIAL_SALT)
    } else if version == VERSION_1 {
        Ok(V1_INITIAL_SALT)
    } else {
        Err(Error::UnsupportedVersion(version))
    }
}

/// ALPN token for the HTTP/0.9 test protocol of a version
///
/// Draft versions use `hq-NN` with the draft number in decimal.
pub fn alpn_for_version(version: u32) -> String {
    if is_draft(version) {
        format!("hq-{:02}", version & 0xff)
    } else {
        "hq-interop".to_string()
    }
}

// ============================================================================
// Supported Range
// ============================================================================

/// Inclusive range of versions accepted during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub min: u32,
    pub max: u32,
}

impl Default for VersionRange {
    fn default() -> Self {
        Self {
            min: MIN_SUPPORTED_VERSION,
            max: MAX_SUPPORTED_VERSION,
        }
    }
}

impl VersionRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, version: u32) -> bool {
        self.min <= version && version <= self.max
    }

    /// First offered version inside the range
    pub fn select(&self, offered: &[u32]) -> Result<u32> {
        offered
            .iter()
            .copied()
            .find(|v| self.contains(*v))
            .ok_or(Error::NoAppropriateVersion)
    }
}

// ============================================================================
// Version Negotiation State Machine
// ============================================================================

/// Negotiation state of one connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    #[default]
    NotNegotiated,
    Negotiated(u32),
    Failed,
}

impl NegotiationState {
    /// Handle the versions offered by a Version Negotiation packet
    ///
    /// Returns the version to restart with. A failure is final: later
    /// packets do not revive the attempt. Once negotiated, further
    /// Version Negotiation packets are ignored and the agreed version is
    /// returned unchanged.
    pub fn on_version_negotiation(&mut self, range: &VersionRange, offered: &[u32]) -> Result<u32> {
        match *self {
            NegotiationState::Failed => Err(Error::NoAppropriateVersion),
            NegotiationState::Negotiated(v) => Ok(v),
            NegotiationState::NotNegotiated => match range.select(offered) {
                Ok(v) => {
                    *self = NegotiationState::Negotiated(v);
                    Ok(v)
                }
                Err(e) => {
                    *self = NegotiationState::Failed;
                    Err(e)
                }
            },
        }
    }
}
