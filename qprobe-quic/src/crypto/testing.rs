//! Deterministic crypto collaborator for tests.
//!
//! Not secure in any way: keystreams and tags come from an FNV-style
//! mixer. They still behave like an AEAD as far as the engine can tell:
//! a wrong key, header or ciphertext fails authentication.

use super::{
    CryptoProvider, EncryptionLevel, HandshakeMessage, HandshakeOutput, HeaderProtectionCipher,
    PacketCipher, TlsSession,
};
use crate::error::{Error, Result};
use crate::transport::{TransportParameters, TransportParametersExtension};
use crate::types::{PacketNumber, Side};
use crate::version::{DRAFT_12, DRAFT_13};
use bytes::Bytes;

const TAG_LEN: usize = 16;

fn mix(parts: &[&[u8]], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 8);
    let mut counter = 0u64;
    while out.len() < len {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325 ^ counter;
        for part in parts {
            for b in *part {
                h ^= *b as u64;
                h = h.wrapping_mul(0x0000_0100_0000_01b3);
            }
            h ^= 0xff;
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
        out.extend_from_slice(&h.to_be_bytes());
        counter += 1;
    }
    out.truncate(len);
    out
}

/// Provider whose keys are the secrets themselves
#[derive(Debug, Clone, Default)]
pub struct TestCryptoProvider;

impl CryptoProvider for TestCryptoProvider {
    fn hkdf_extract(&self, salt: &[u8], ikm: &[u8]) -> Result<Vec<u8>> {
        Ok(mix(&[b"extract", salt, ikm], 32))
    }

    fn hkdf_expand_label(
        &self,
        secret: &[u8],
        label: &str,
        context: &[u8],
        len: usize,
    ) -> Result<Vec<u8>> {
        Ok(mix(&[b"expand", secret, label.as_bytes(), context], len))
    }

    fn new_aead(&self, secret: &[u8], _is_write: bool) -> Result<Box<dyn PacketCipher>> {
        Ok(Box::new(TestAead {
            key: mix(&[b"key", secret], 16),
        }))
    }

    fn new_header_protection(&self, secret: &[u8]) -> Result<Box<dyn HeaderProtectionCipher>> {
        Ok(Box::new(TestHeaderProtection {
            key: mix(&[b"hp", secret], 16),
        }))
    }
}

/// Stream cipher with a 16-byte tag over header and plaintext
#[derive(Debug, Clone)]
pub struct TestAead {
    key: Vec<u8>,
}

impl PacketCipher for TestAead {
    fn overhead(&self) -> usize {
        TAG_LEN
    }

    fn seal(&self, packet_number: PacketNumber, header: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
        let pn = packet_number.to_be_bytes();
        let keystream = mix(&[&self.key, &pn], payload.len());
        let mut out: Vec<u8> = payload.iter().zip(&keystream).map(|(p, k)| p ^ k).collect();
        out.extend_from_slice(&mix(&[&self.key, &pn, header, payload], TAG_LEN));
        Ok(out)
    }

    fn open(&self, packet_number: PacketNumber, header: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_LEN {
            return Err(Error::DecryptionFailed);
        }
        let (body, tag) = ciphertext.split_at(ciphertext.len() - TAG_LEN);
        let pn = packet_number.to_be_bytes();
        let keystream = mix(&[&self.key, &pn], body.len());
        let plain: Vec<u8> = body.iter().zip(&keystream).map(|(c, k)| c ^ k).collect();
        if mix(&[&self.key, &pn, header, &plain], TAG_LEN) != tag {
            return Err(Error::DecryptionFailed);
        }
        Ok(plain)
    }
}

/// Mask derived from key and sample
#[derive(Debug, Clone)]
pub struct TestHeaderProtection {
    key: Vec<u8>,
}

impl HeaderProtectionCipher for TestHeaderProtection {
    fn mask(&self, sample: &[u8]) -> Result<[u8; 5]> {
        if sample.len() != super::SAMPLE_LEN {
            return Err(Error::Crypto(format!("sample of {} bytes", sample.len())));
        }
        let m = mix(&[&self.key, sample], 5);
        Ok([m[0], m[1], m[2], m[3], m[4]])
    }
}

/// Three-step handshake script
///
/// Client: empty input at Initial emits the first flight; input at Initial
/// installs Handshake secrets; input at Handshake installs 1-RTT secrets,
/// emits the Finished message and completes. The server mirrors it.
#[derive(Debug, Clone)]
pub struct ScriptedTlsSession {
    side: Side,
    levels_ready: Vec<EncryptionLevel>,
    local_params: Vec<u8>,
    peer_params: Option<Vec<u8>>,
    fail_with: Option<String>,
}

impl ScriptedTlsSession {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            levels_ready: Vec::new(),
            local_params: Vec::new(),
            peer_params: None,
            fail_with: None,
        }
    }

    /// Make every call to `handle_message` fail
    pub fn failing(side: Side, reason: &str) -> Self {
        let mut s = Self::new(side);
        s.fail_with = Some(reason.to_string());
        s
    }

    /// Secret both sides agree on for `level` and the sender `side`
    pub fn secret(level: EncryptionLevel, sender: Side) -> Vec<u8> {
        format!("{:?}-{:?}", level, sender).into_bytes()
    }

    /// Default parameters as the peer of this side would announce them
    fn peer_extension(&self) -> Option<Vec<u8>> {
        let parameters = TransportParameters::default();
        let ext = match self.side {
            Side::Client => TransportParametersExtension::EncryptedExtensions {
                negotiated_version: DRAFT_13,
                supported_versions: vec![DRAFT_12, DRAFT_13],
                parameters,
            },
            Side::Server => TransportParametersExtension::ClientHello {
                initial_version: DRAFT_13,
                parameters,
            },
        };
        ext.encode().ok().map(|b| b.to_vec())
    }

    fn secret_for(&self, level: EncryptionLevel, sender: Side) -> Option<Vec<u8>> {
        self.levels_ready
            .contains(&level)
            .then(|| Self::secret(level, sender))
    }
}

impl TlsSession for ScriptedTlsSession {
    fn handle_message(&mut self, data: &[u8], level: EncryptionLevel) -> Result<HandshakeOutput> {
        if let Some(reason) = &self.fail_with {
            return Err(Error::Crypto(reason.clone()));
        }
        let message = |level, data: &'static [u8]| HandshakeMessage {
            level,
            data: Bytes::from_static(data),
        };
        match (self.side, level, data.is_empty()) {
            (Side::Client, EncryptionLevel::Initial, true) => Ok(HandshakeOutput {
                messages: vec![message(EncryptionLevel::Initial, b"client hello")],
                in_progress: true,
            }),
            (Side::Client, EncryptionLevel::Initial, false) => {
                self.levels_ready.push(EncryptionLevel::Handshake);
                Ok(HandshakeOutput {
                    messages: Vec::new(),
                    in_progress: true,
                })
            }
            (Side::Client, EncryptionLevel::Handshake, false) => {
                self.levels_ready.push(EncryptionLevel::OneRtt);
                self.peer_params = self.peer_extension();
                Ok(HandshakeOutput {
                    messages: vec![message(EncryptionLevel::Handshake, b"client finished")],
                    in_progress: false,
                })
            }
            (Side::Server, EncryptionLevel::Initial, false) => {
                self.peer_params = self.peer_extension();
                self.levels_ready.push(EncryptionLevel::Handshake);
                self.levels_ready.push(EncryptionLevel::OneRtt);
                Ok(HandshakeOutput {
                    messages: vec![
                        message(EncryptionLevel::Initial, b"server hello"),
                        message(EncryptionLevel::Handshake, b"server finished"),
                    ],
                    in_progress: true,
                })
            }
            (Side::Server, EncryptionLevel::Handshake, false) => Ok(HandshakeOutput {
                messages: Vec::new(),
                in_progress: false,
            }),
            _ => Ok(HandshakeOutput {
                messages: Vec::new(),
                in_progress: true,
            }),
        }
    }

    fn read_secret(&self, level: EncryptionLevel) -> Option<Vec<u8>> {
        self.secret_for(level, self.side.opposite())
    }

    fn write_secret(&self, level: EncryptionLevel) -> Option<Vec<u8>> {
        self.secret_for(level, self.side)
    }

    fn set_transport_parameters(&mut self, encoded: &[u8]) -> Result<()> {
        self.local_params = encoded.to_vec();
        Ok(())
    }

    fn peer_transport_parameters(&self) -> Option<Vec<u8>> {
        self.peer_params.clone()
    }

    fn alpn(&self) -> Option<String> {
        self.levels_ready
            .contains(&EncryptionLevel::OneRtt)
            .then(|| "hq-13".to_string())
    }

    fn reset(&mut self) -> Result<()> {
        self.levels_ready.clear();
        self.peer_params = None;
        Ok(())
    }
}
