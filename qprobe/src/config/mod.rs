//! Probe configuration module.
//!
//! One TOML document configures a run: the server to probe and how the
//! connection attempt presents itself, the agent timers, channel capacities,
//! logging and the tokio runtime.
//!
//! # Example
//!
//! ```toml
//! [connection]
//! host = "quic.example.net"
//! port = 4433
//! initial_version = 4278190093 # 0xff00000d
//!
//! [connection.transport]
//! initial_max_data = 65536
//!
//! [agents]
//! retransmit_threshold_ms = 500
//!
//! [logging]
//! level = "debug"
//! ```

pub mod connection;
pub mod global;
pub mod loader;

pub use connection::{ConnectionSettings, TransportSettings};
pub use global::{AgentConfig, LogLevel, LoggingConfig, RuntimeConfig};
pub use loader::{load_config, CliArgs};

use crate::channel_config::ChannelConfig;
use serde::{Deserialize, Serialize};

/// Master configuration composing all subsystems.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub connection: ConnectionSettings,
    pub agents: AgentConfig,
    pub channels: ChannelConfig,
    pub logging: LoggingConfig,
    pub runtime: RuntimeConfig,
}

impl ProbeConfig {
    /// Validate the entire configuration, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.connection.validate() {
            errors.extend(e.into_iter().map(|e| format!("connection: {}", e)));
        }

        if let Err(e) = self.agents.validate() {
            errors.extend(e.into_iter().map(|e| format!("agents: {}", e)));
        }

        if let Err(e) = self.channels.validate() {
            errors.push(format!("channels: {}", e));
        }

        if let Err(e) = self.runtime.validate() {
            errors.extend(e.into_iter().map(|e| format!("runtime: {}", e)));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
