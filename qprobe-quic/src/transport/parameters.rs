//! # Transport Parameters
//!
//! Parameters travel inside a TLS extension as a list of
//! `u16 id | u16 length | value` entries. The list is prefixed by version
//! information that depends on who sends it:
//!
//! ```text
//! ClientHello:          initial_version u32 | u16 len | parameters
//! EncryptedExtensions:  negotiated_version u32 | u8 len | versions u32* |
//!                       u16 len | parameters
//! ```
//!
//! ## Parameter IDs
//!
//! | id     | name                                  | width  |
//! |--------|---------------------------------------|--------|
//! | 0x0000 | initial_max_stream_data_bidi_local    | u32    |
//! | 0x0001 | initial_max_data                      | u32    |
//! | 0x0002 | initial_max_bidi_streams              | u16    |
//! | 0x0003 | idle_timeout (seconds)                | u16    |
//! | 0x0004 | preferred_address                     | opaque |
//! | 0x0005 | max_packet_size                       | u16    |
//! | 0x0006 | stateless_reset_token                 | 16     |
//! | 0x0007 | ack_delay_exponent                    | u8     |
//! | 0x0008 | initial_max_uni_streams               | u16    |
//! | 0x0009 | disable_migration                     | empty  |
//! | 0x000a | initial_max_stream_data_bidi_remote   | u32    |
//! | 0x000b | initial_max_stream_data_uni           | u32    |
//!
//! Zero and false values are left out of the encoding; unknown ids are kept
//! as additional parameters.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::types::Cursor;
use bytes::{BufMut, Bytes, BytesMut};

/// Transport Parameter ID
pub type TransportParameterId = u16;

pub const TP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: TransportParameterId = 0x0000;
pub const TP_INITIAL_MAX_DATA: TransportParameterId = 0x0001;
pub const TP_INITIAL_MAX_BIDI_STREAMS: TransportParameterId = 0x0002;
pub const TP_IDLE_TIMEOUT: TransportParameterId = 0x0003;
pub const TP_PREFERRED_ADDRESS: TransportParameterId = 0x0004;
pub const TP_MAX_PACKET_SIZE: TransportParameterId = 0x0005;
pub const TP_STATELESS_RESET_TOKEN: TransportParameterId = 0x0006;
pub const TP_ACK_DELAY_EXPONENT: TransportParameterId = 0x0007;
pub const TP_INITIAL_MAX_UNI_STREAMS: TransportParameterId = 0x0008;
pub const TP_DISABLE_MIGRATION: TransportParameterId = 0x0009;
pub const TP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: TransportParameterId = 0x000a;
pub const TP_INITIAL_MAX_STREAM_DATA_UNI: TransportParameterId = 0x000b;

/// Ack delay exponent assumed when the peer does not send one
pub const DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;

/// Local defaults: 16 KiB per stream, 32 KiB per connection
pub const DEFAULT_INITIAL_MAX_STREAM_DATA: u64 = 16 * 1024;
pub const DEFAULT_INITIAL_MAX_DATA: u64 = 32 * 1024;
pub const DEFAULT_MAX_STREAMS: u64 = 1;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 10;

/// Transport Parameters Structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_data: u64,
    pub initial_max_bidi_streams: u64,
    /// Seconds
    pub idle_timeout: u64,
    /// Kept opaque
    pub preferred_address: Option<Bytes>,
    pub max_packet_size: u64,
    pub stateless_reset_token: Option<[u8; 16]>,
    pub ack_delay_exponent: u8,
    pub initial_max_uni_streams: u64,
    pub disable_migration: bool,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,

    /// Parameters with ids this endpoint does not interpret
    pub additional_parameters: Vec<(TransportParameterId, Bytes)>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            initial_max_stream_data_bidi_local: DEFAULT_INITIAL_MAX_STREAM_DATA,
            initial_max_data: DEFAULT_INITIAL_MAX_DATA,
            initial_max_bidi_streams: DEFAULT_MAX_STREAMS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            preferred_address: None,
            max_packet_size: 0,
            stateless_reset_token: None,
            ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
            initial_max_uni_streams: DEFAULT_MAX_STREAMS,
            disable_migration: false,
            initial_max_stream_data_bidi_remote: DEFAULT_INITIAL_MAX_STREAM_DATA,
            initial_max_stream_data_uni: DEFAULT_INITIAL_MAX_STREAM_DATA,
            additional_parameters: Vec::new(),
        }
    }
}

impl TransportParameters {
    /// Parameters with every limit at zero, as assumed before the peer's
    /// parameters are known
    pub fn empty() -> Self {
        Self {
            initial_max_stream_data_bidi_local: 0,
            initial_max_data: 0,
            initial_max_bidi_streams: 0,
            idle_timeout: 0,
            preferred_address: None,
            max_packet_size: 0,
            stateless_reset_token: None,
            ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
            initial_max_uni_streams: 0,
            disable_migration: false,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            additional_parameters: Vec::new(),
        }
    }

    /// Check ranges that cannot be expressed on the wire
    pub fn validate(&self) -> Result<()> {
        let fits = |v: u64, width: usize| width >= 8 || v < (1u64 << (8 * width));
        let checks = [
            fits(self.initial_max_stream_data_bidi_local, 4),
            fits(self.initial_max_data, 4),
            fits(self.initial_max_bidi_streams, 2),
            fits(self.idle_timeout, 2),
            fits(self.max_packet_size, 2),
            fits(self.initial_max_uni_streams, 2),
            fits(self.initial_max_stream_data_bidi_remote, 4),
            fits(self.initial_max_stream_data_uni, 4),
            self.ack_delay_exponent <= 20,
        ];
        if checks.iter().all(|ok| *ok) {
            Ok(())
        } else {
            Err(Error::InvalidTransportParameter)
        }
    }

    /// Encode the parameter list with its u16 length prefix
    pub fn encode_list(&self, buf: &mut BytesMut) -> Result<()> {
        self.validate()?;
        let mut list = BytesMut::new();
        let mut put_uint = |id: TransportParameterId, value: u64, width: usize| {
            if value == 0 {
                return;
            }
            list.put_u16(id);
            list.put_u16(width as u16);
            list.put_slice(&value.to_be_bytes()[8 - width..]);
        };
        put_uint(TP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL, self.initial_max_stream_data_bidi_local, 4);
        put_uint(TP_INITIAL_MAX_DATA, self.initial_max_data, 4);
        put_uint(TP_INITIAL_MAX_BIDI_STREAMS, self.initial_max_bidi_streams, 2);
        put_uint(TP_IDLE_TIMEOUT, self.idle_timeout, 2);
        put_uint(TP_MAX_PACKET_SIZE, self.max_packet_size, 2);
        put_uint(TP_ACK_DELAY_EXPONENT, self.ack_delay_exponent as u64, 1);
        put_uint(TP_INITIAL_MAX_UNI_STREAMS, self.initial_max_uni_streams, 2);
        put_uint(
            TP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
            4,
        );
        put_uint(TP_INITIAL_MAX_STREAM_DATA_UNI, self.initial_max_stream_data_uni, 4);

        let mut put_opaque = |id: TransportParameterId, value: &[u8]| -> Result<()> {
            let len = u16::try_from(value.len()).map_err(|_| Error::InvalidTransportParameter)?;
            list.put_u16(id);
            list.put_u16(len);
            list.put_slice(value);
            Ok(())
        };
        if let Some(addr) = &self.preferred_address {
            put_opaque(TP_PREFERRED_ADDRESS, addr)?;
        }
        if let Some(token) = &self.stateless_reset_token {
            put_opaque(TP_STATELESS_RESET_TOKEN, token)?;
        }
        if self.disable_migration {
            put_opaque(TP_DISABLE_MIGRATION, &[])?;
        }
        for (id, value) in &self.additional_parameters {
            put_opaque(*id, value)?;
        }

        let len = u16::try_from(list.len()).map_err(|_| Error::InvalidTransportParameter)?;
        buf.put_u16(len);
        buf.put_slice(&list);
        Ok(())
    }

    /// Decode a u16-length-prefixed parameter list
    pub fn decode_list(cursor: &mut Cursor<'_>) -> Result<Self> {
        let len = cursor.read_u16()? as usize;
        let mut list = Cursor::new(cursor.read_bytes(len)?);
        let mut params = TransportParameters::empty();

        while !list.is_empty() {
            let id = list.read_u16()?;
            let len = list.read_u16()? as usize;
            let value = list.read_bytes(len)?;
            let uint = || -> Result<u64> {
                if value.is_empty() || value.len() > 8 {
                    return Err(Error::InvalidTransportParameter);
                }
                Ok(value.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
            };
            match id {
                TP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = uint()?
                }
                TP_INITIAL_MAX_DATA => params.initial_max_data = uint()?,
                TP_INITIAL_MAX_BIDI_STREAMS => params.initial_max_bidi_streams = uint()?,
                TP_IDLE_TIMEOUT => params.idle_timeout = uint()?,
                TP_PREFERRED_ADDRESS => params.preferred_address = Some(Bytes::copy_from_slice(value)),
                TP_MAX_PACKET_SIZE => params.max_packet_size = uint()?,
                TP_STATELESS_RESET_TOKEN => {
                    let token: [u8; 16] =
                        value.try_into().map_err(|_| Error::InvalidTransportParameter)?;
                    params.stateless_reset_token = Some(token);
                }
                TP_ACK_DELAY_EXPONENT => {
                    params.ack_delay_exponent =
                        u8::try_from(uint()?).map_err(|_| Error::InvalidTransportParameter)?
                }
                TP_INITIAL_MAX_UNI_STREAMS => params.initial_max_uni_streams = uint()?,
                TP_DISABLE_MIGRATION => params.disable_migration = true,
                TP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = uint()?
                }
                TP_INITIAL_MAX_STREAM_DATA_UNI => params.initial_max_stream_data_uni = uint()?,
                other => params
                    .additional_parameters
                    .push((other, Bytes::copy_from_slice(value))),
            }
        }
        Ok(params)
    }
}

/// Transport parameter extension with its version prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportParametersExtension {
    /// Sent by the client in its ClientHello
    ClientHello {
        initial_version: u32,
        parameters: TransportParameters,
    },
    /// Sent by the server in EncryptedExtensions
    EncryptedExtensions {
        negotiated_version: u32,
        supported_versions: Vec<u32>,
        parameters: TransportParameters,
    },
}

impl TransportParametersExtension {
    pub fn parameters(&self) -> &TransportParameters {
        match self {
            TransportParametersExtension::ClientHello { parameters, .. }
            | TransportParametersExtension::EncryptedExtensions { parameters, .. } => parameters,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            TransportParametersExtension::ClientHello {
                initial_version,
                parameters,
            } => {
                buf.put_u32(*initial_version);
                parameters.encode_list(&mut buf)?;
            }
            TransportParametersExtension::EncryptedExtensions {
                negotiated_version,
                supported_versions,
                parameters,
            } => {
                buf.put_u32(*negotiated_version);
                let len = u8::try_from(supported_versions.len() * 4)
                    .map_err(|_| Error::InvalidTransportParameter)?;
                buf.put_u8(len);
                for v in supported_versions {
                    buf.put_u32(*v);
                }
                parameters.encode_list(&mut buf)?;
            }
        }
        Ok(buf.freeze())
    }

    /// Decode the extension sent by a client (`from_client`) or a server
    pub fn decode(data: &[u8], from_client: bool) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let ext = if from_client {
            let initial_version = cursor.read_u32()?;
            TransportParametersExtension::ClientHello {
                initial_version,
                parameters: TransportParameters::decode_list(&mut cursor)?,
            }
        } else {
            let negotiated_version = cursor.read_u32()?;
            let len = cursor.read_u8()? as usize;
            if len % 4 != 0 {
                return Err(Error::InvalidTransportParameter);
            }
            let mut versions = Cursor::new(cursor.read_bytes(len)?);
            let mut supported_versions = Vec::with_capacity(len / 4);
            while !versions.is_empty() {
                supported_versions.push(versions.read_u32()?);
            }
            TransportParametersExtension::EncryptedExtensions {
                negotiated_version,
                supported_versions,
                parameters: TransportParameters::decode_list(&mut cursor)?,
            }
        };
        if !cursor.is_empty() {
            return Err(Error::InvalidTransportParameter);
        }
        Ok(ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{DRAFT_12, DRAFT_13};

    #[test]
    fn test_default_client_parameters_encoding() {
        let ext = TransportParametersExtension::ClientHello {
            initial_version: DRAFT_13,
            parameters: TransportParameters::default(),
        };
        let bytes = ext.encode().unwrap();
        assert_eq!(&bytes[..4], &DRAFT_13.to_be_bytes());
        // initial_max_stream_data_bidi_local = 16384 as u32 right after the
        // list length
        assert_eq!(&bytes[6..14], &[0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x40, 0x00]);
        assert_eq!(TransportParametersExtension::decode(&bytes, true).unwrap(), ext);
    }

    #[test]
    fn test_zero_values_are_omitted() {
        let params = TransportParameters::empty();
        let mut buf = BytesMut::new();
        params.encode_list(&mut buf).unwrap();
        // Only the default ack delay exponent remains: id, len 1, value 3
        assert_eq!(&buf[..], &[0x00, 0x05, 0x00, 0x07, 0x00, 0x01, 0x03]);
    }

    #[test]
    fn test_server_extension_with_versions_and_unknown_ids() {
        let mut parameters = TransportParameters::empty();
        parameters.initial_max_data = 1 << 20;
        parameters.stateless_reset_token = Some([7; 16]);
        parameters.disable_migration = true;
        parameters.additional_parameters.push((0x2a2a, Bytes::from_static(b"grease")));
        let ext = TransportParametersExtension::EncryptedExtensions {
            negotiated_version: DRAFT_13,
            supported_versions: vec![DRAFT_12, DRAFT_13],
            parameters,
        };
        let bytes = ext.encode().unwrap();
        let decoded = TransportParametersExtension::decode(&bytes, false).unwrap();
        assert_eq!(decoded, ext);
        assert_eq!(decoded.parameters().additional_parameters[0].0, 0x2a2a);
    }

    #[test]
    fn test_values_too_wide_rejected() {
        let mut params = TransportParameters::default();
        params.initial_max_bidi_streams = 70_000;
        assert_eq!(params.validate(), Err(Error::InvalidTransportParameter));
        let mut buf = BytesMut::new();
        assert!(params.encode_list(&mut buf).is_err());
    }

    #[test]
    fn test_truncated_list_rejected() {
        let data = [0xff, 0x00, 0x00, 0x0d, 0x00, 0x08, 0x00, 0x01, 0x00, 0x04, 0x00];
        assert_eq!(
            TransportParametersExtension::decode(&data, true),
            Err(Error::UnexpectedEnd)
        );
    }

    #[test]
    fn test_bad_token_length_rejected() {
        let data = [
            0xff, 0x00, 0x00, 0x0d, 0x00, 0x06, 0x00, 0x06, 0x00, 0x02, 0xaa, 0xbb,
        ];
        assert_eq!(
            TransportParametersExtension::decode(&data, true),
            Err(Error::InvalidTransportParameter)
        );
    }
}
