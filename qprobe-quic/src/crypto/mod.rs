//! # Crypto Capability Interface
//!
//! The engine never implements cryptographic primitives. A collaborator
//! provides HKDF, AEAD and header-protection ciphers through
//! [`CryptoProvider`], and the TLS handshake through [`TlsSession`].
//! This module owns the per-level [`CryptoState`] built from those
//! capabilities and the Initial key derivation.
//!
//! ## Design:
//! The traits abstract the crypto provider, allowing unit testing with a
//! deterministic provider (see [`testing`]) and algorithm swapping.

#![forbid(unsafe_code)]

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

use crate::error::{Error, Result};
use crate::types::{ConnectionId, PacketNumber, PacketNumberSpace, Side};
use crate::version;
use bytes::Bytes;
use std::sync::Arc;

/// Label used to derive the client Initial secret
pub const CLIENT_INITIAL_LABEL: &str = "client in";

/// Label used to derive the server Initial secret
pub const SERVER_INITIAL_LABEL: &str = "server in";

/// Length of secrets derived for the Initial level
pub const INITIAL_SECRET_LEN: usize = 32;

/// Length of the ciphertext sample fed to header protection
pub const SAMPLE_LEN: usize = 16;

// ============================================================================
// Encryption Levels
// ============================================================================

/// Encryption Level
///
/// Named phases of key material. `Best` and `BestAppData` are virtual
/// selectors resolved to the most advanced level available when a packet
/// is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EncryptionLevel {
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
    /// Most advanced level available
    Best,
    /// Most advanced application-data level available
    BestAppData,
}

impl EncryptionLevel {
    /// Levels backed by real keys
    pub const REAL: [EncryptionLevel; 4] = [
        EncryptionLevel::Initial,
        EncryptionLevel::ZeroRtt,
        EncryptionLevel::Handshake,
        EncryptionLevel::OneRtt,
    ];

    /// Order in which `Best` is resolved
    pub const BEST_ORDER: [EncryptionLevel; 3] = [
        EncryptionLevel::OneRtt,
        EncryptionLevel::Handshake,
        EncryptionLevel::Initial,
    ];

    /// Order in which `BestAppData` is resolved
    pub const BEST_APP_DATA_ORDER: [EncryptionLevel; 2] =
        [EncryptionLevel::OneRtt, EncryptionLevel::ZeroRtt];

    /// Map encryption level to packet number space
    ///
    /// Virtual levels have no space of their own until resolved.
    pub fn space(self) -> PacketNumberSpace {
        match self {
            EncryptionLevel::Initial => PacketNumberSpace::Initial,
            EncryptionLevel::Handshake => PacketNumberSpace::Handshake,
            EncryptionLevel::ZeroRtt | EncryptionLevel::OneRtt => PacketNumberSpace::ApplicationData,
            EncryptionLevel::Best | EncryptionLevel::BestAppData => PacketNumberSpace::NoSpace,
        }
    }

    pub fn is_virtual(self) -> bool {
        matches!(self, EncryptionLevel::Best | EncryptionLevel::BestAppData)
    }

    /// Index into per-level arrays, None for virtual levels
    pub fn index(self) -> Option<usize> {
        match self {
            EncryptionLevel::Initial => Some(0),
            EncryptionLevel::ZeroRtt => Some(1),
            EncryptionLevel::Handshake => Some(2),
            EncryptionLevel::OneRtt => Some(3),
            EncryptionLevel::Best | EncryptionLevel::BestAppData => None,
        }
    }

    /// Whether stream data may be carried at this level
    pub fn carries_app_data(self) -> bool {
        matches!(
            self,
            EncryptionLevel::ZeroRtt | EncryptionLevel::OneRtt | EncryptionLevel::BestAppData
        )
    }

    /// Level used to carry CRYPTO frames of a packet number space
    pub fn for_crypto_space(space: PacketNumberSpace) -> Option<EncryptionLevel> {
        match space {
            PacketNumberSpace::Initial => Some(EncryptionLevel::Initial),
            PacketNumberSpace::Handshake => Some(EncryptionLevel::Handshake),
            PacketNumberSpace::ApplicationData => Some(EncryptionLevel::OneRtt),
            PacketNumberSpace::NoSpace => None,
        }
    }
}

/// Direction of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyDirection {
    Read,
    Write,
}

/// Announcement that keys for one (level, direction) pair were installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectionalEncryptionLevel {
    pub level: EncryptionLevel,
    pub direction: KeyDirection,
    pub available: bool,
}

// ============================================================================
// Capability Traits
// ============================================================================

/// Packet payload AEAD (nonce derived from the packet number)
pub trait PacketCipher: Send + Sync {
    /// Authentication tag length added by `seal`
    fn overhead(&self) -> usize;

    /// Encrypt `payload` with `header` as associated data
    fn seal(&self, packet_number: PacketNumber, header: &[u8], payload: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt and authenticate `ciphertext`
    ///
    /// # Errors
    /// Returns Error::DecryptionFailed if authentication fails
    fn open(&self, packet_number: PacketNumber, header: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Header protection cipher
pub trait HeaderProtectionCipher: Send + Sync {
    /// Derive the 5-byte mask from a 16-byte ciphertext sample
    fn mask(&self, sample: &[u8]) -> Result<[u8; 5]>;
}

/// Cryptographic primitives supplied by the TLS collaborator
pub trait CryptoProvider: Send + Sync {
    fn hkdf_extract(&self, salt: &[u8], ikm: &[u8]) -> Result<Vec<u8>>;

    fn hkdf_expand_label(
        &self,
        secret: &[u8],
        label: &str,
        context: &[u8],
        len: usize,
    ) -> Result<Vec<u8>>;

    /// Build the packet AEAD keyed from a traffic secret
    fn new_aead(&self, secret: &[u8], is_write: bool) -> Result<Box<dyn PacketCipher>>;

    /// Build the header protection cipher keyed from a traffic secret
    fn new_header_protection(&self, secret: &[u8]) -> Result<Box<dyn HeaderProtectionCipher>>;
}

/// A handshake message produced by TLS for one encryption level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub level: EncryptionLevel,
    pub data: Bytes,
}

/// Result of feeding bytes into the TLS session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeOutput {
    pub messages: Vec<HandshakeMessage>,
    pub in_progress: bool,
}

/// TLS handshake collaborator
pub trait TlsSession: Send {
    /// Feed handshake bytes received at `level`; empty input starts the
    /// handshake on the client side
    fn handle_message(&mut self, data: &[u8], level: EncryptionLevel) -> Result<HandshakeOutput>;

    /// Read secret for `level`, once derived
    fn read_secret(&self, level: EncryptionLevel) -> Option<Vec<u8>>;

    /// Write secret for `level`, once derived
    fn write_secret(&self, level: EncryptionLevel) -> Option<Vec<u8>>;

    /// Provide the local transport parameter extension
    fn set_transport_parameters(&mut self, encoded: &[u8]) -> Result<()>;

    /// Peer transport parameter extension, once received
    fn peer_transport_parameters(&self) -> Option<Vec<u8>>;

    /// Negotiated ALPN
    fn alpn(&self) -> Option<String> {
        None
    }

    /// Restart from scratch after Version Negotiation or Retry
    fn reset(&mut self) -> Result<()>;
}

// ============================================================================
// Per-Level Crypto State
// ============================================================================

/// Keys installed for one encryption level
#[derive(Clone, Default)]
pub struct CryptoState {
    pub read: Option<Arc<dyn PacketCipher>>,
    pub write: Option<Arc<dyn PacketCipher>>,
    pub read_hp: Option<Arc<dyn HeaderProtectionCipher>>,
    pub write_hp: Option<Arc<dyn HeaderProtectionCipher>>,
}

impl core::fmt::Debug for CryptoState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CryptoState")
            .field("read", &self.read.is_some())
            .field("write", &self.write.is_some())
            .finish()
    }
}

impl CryptoState {
    /// Initial keys derived from the client's original destination id
    pub fn initial(
        provider: &dyn CryptoProvider,
        version: u32,
        dcid: &ConnectionId,
        side: Side,
    ) -> Result<Self> {
        let salt = version::initial_salt(version)?;
        let initial_secret = provider.hkdf_extract(salt, dcid.as_bytes())?;
        let client = provider.hkdf_expand_label(
            &initial_secret,
            CLIENT_INITIAL_LABEL,
            &[],
            INITIAL_SECRET_LEN,
        )?;
        let server = provider.hkdf_expand_label(
            &initial_secret,
            SERVER_INITIAL_LABEL,
            &[],
            INITIAL_SECRET_LEN,
        )?;

        let (read_secret, write_secret) = match side {
            Side::Client => (server, client),
            Side::Server => (client, server),
        };

        let mut state = CryptoState::default();
        state.install(provider, KeyDirection::Read, &read_secret)?;
        state.install(provider, KeyDirection::Write, &write_secret)?;
        Ok(state)
    }

    /// Install one direction's keys from a traffic secret
    pub fn install(
        &mut self,
        provider: &dyn CryptoProvider,
        direction: KeyDirection,
        secret: &[u8],
    ) -> Result<()> {
        let aead: Arc<dyn PacketCipher> =
            Arc::from(provider.new_aead(secret, direction == KeyDirection::Write)?);
        let hp: Arc<dyn HeaderProtectionCipher> = Arc::from(provider.new_header_protection(secret)?);
        match direction {
            KeyDirection::Read => {
                self.read = Some(aead);
                self.read_hp = Some(hp);
            }
            KeyDirection::Write => {
                self.write = Some(aead);
                self.write_hp = Some(hp);
            }
        }
        Ok(())
    }

    pub fn can_read(&self) -> bool {
        self.read.is_some() && self.read_hp.is_some()
    }

    pub fn can_write(&self) -> bool {
        self.write.is_some() && self.write_hp.is_some()
    }

    /// Write-side AEAD overhead, zero when not installed
    pub fn write_overhead(&self) -> usize {
        self.write.as_ref().map(|a| a.overhead()).unwrap_or(0)
    }
}

/// Keys of every real level
#[derive(Debug, Clone, Default)]
pub struct CryptoStates {
    levels: [CryptoState; 4],
}

impl CryptoStates {
    pub fn get(&self, level: EncryptionLevel) -> Result<&CryptoState> {
        let idx = level.index().ok_or(Error::KeysUnavailable(level))?;
        Ok(&self.levels[idx])
    }

    pub fn get_mut(&mut self, level: EncryptionLevel) -> Result<&mut CryptoState> {
        let idx = level.index().ok_or(Error::KeysUnavailable(level))?;
        Ok(&mut self.levels[idx])
    }

    /// Whether `direction` keys exist for a real level
    pub fn is_available(&self, level: EncryptionLevel, direction: KeyDirection) -> bool {
        match self.get(level) {
            Ok(state) => match direction {
                KeyDirection::Read => state.can_read(),
                KeyDirection::Write => state.can_write(),
            },
            Err(_) => false,
        }
    }

    /// Resolve a level to a real one with `direction` keys available
    ///
    /// Real levels resolve to themselves when their keys are installed.
    pub fn resolve(&self, level: EncryptionLevel, direction: KeyDirection) -> Option<EncryptionLevel> {
        let order: &[EncryptionLevel] = match level {
            EncryptionLevel::Best => &EncryptionLevel::BEST_ORDER,
            EncryptionLevel::BestAppData => &EncryptionLevel::BEST_APP_DATA_ORDER,
            _ => return self.is_available(level, direction).then_some(level),
        };
        order
            .iter()
            .copied()
            .find(|l| self.is_available(*l, direction))
    }

    /// Drop every installed key
    pub fn clear(&mut self) {
        self.levels = Default::default();
    }
}
