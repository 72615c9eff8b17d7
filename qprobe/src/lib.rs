//! qprobe: a concurrent QUIC test endpoint.
//!
//! The protocol itself lives in the sans-IO `qprobe-quic` engine; this crate
//! runs one connection attempt as a set of tokio agents ([`agents`]) joined
//! by typed topics ([`topics`]), plus the configuration, logging and socket
//! plumbing of the `qprobe` binary.

pub mod agents;
pub mod channel_config;
pub mod config;
pub mod net;
pub mod probe;
pub mod runtime;
pub mod telemetry;
pub mod topics;
