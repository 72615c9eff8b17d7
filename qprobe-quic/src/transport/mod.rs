//! Transport parameters exchanged through the TLS handshake.

pub mod parameters;

pub use parameters::{TransportParameterId, TransportParameters, TransportParametersExtension};
