//! Process-wide configuration.
//!
//! Settings shared by every agent of the pipeline: timers and budgets of
//! the agents, runtime configuration, and logging.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timers and budgets of the agent pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Largest datagram the sender assembles.
    ///
    /// **Default:** `1200`
    pub mtu: usize,

    /// How long the sender waits for more frames before flushing a level.
    ///
    /// **Default:** `20` ms
    pub coalescing_delay_ms: u64,

    /// Age after which an unacknowledged packet is considered lost.
    ///
    /// **Default:** `500` ms
    pub retransmit_threshold_ms: u64,

    /// Interval of the recovery scan.
    ///
    /// **Default:** `100` ms
    pub recovery_tick_ms: u64,

    /// Don't schedule ACK frames for received packets.
    ///
    /// Used by scenarios probing how peers react to missing acknowledgements.
    ///
    /// **Default:** `false`
    pub suppress_acks: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mtu: qprobe_quic::types::DEFAULT_MTU,
            coalescing_delay_ms: 20,
            retransmit_threshold_ms: 500,
            recovery_tick_ms: 100,
            suppress_acks: false,
        }
    }
}

impl AgentConfig {
    pub fn coalescing_delay(&self) -> Duration {
        Duration::from_millis(self.coalescing_delay_ms)
    }

    pub fn retransmit_threshold(&self) -> Duration {
        Duration::from_millis(self.retransmit_threshold_ms)
    }

    pub fn recovery_tick(&self) -> Duration {
        Duration::from_millis(self.recovery_tick_ms)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Room for a long header, the AEAD tag and at least one frame
        if self.mtu < 1200 {
            errors.push("mtu must be at least 1200".to_string());
        }

        if self.mtu > qprobe_quic::types::MAX_UDP_PAYLOAD_SIZE {
            errors.push(format!(
                "mtu exceeds the largest UDP payload ({})",
                qprobe_quic::types::MAX_UDP_PAYLOAD_SIZE
            ));
        }

        if self.coalescing_delay_ms == 0 {
            errors.push("coalescing_delay_ms must be > 0".to_string());
        }

        if self.recovery_tick_ms == 0 {
            errors.push("recovery_tick_ms must be > 0".to_string());
        }

        if self.retransmit_threshold_ms < self.recovery_tick_ms {
            errors.push("retransmit_threshold_ms must not be below recovery_tick_ms".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Runtime configuration for the async executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of worker threads for the Tokio runtime.
    ///
    /// **Default:** Number of CPU cores
    pub worker_threads: usize,

    /// Maximum number of blocking threads in the pool.
    ///
    /// **Default:** 64
    pub max_blocking_threads: usize,

    /// Thread name prefix for worker threads.
    ///
    /// **Default:** `"qprobe-worker"`
    pub thread_name: String,

    /// Stack size for each thread in bytes.
    ///
    /// **Default:** 2 MB
    pub thread_stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
            max_blocking_threads: 64,
            thread_name: "qprobe-worker".to_string(),
            thread_stack_size: 2 * 1024 * 1024, // 2MB
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.worker_threads == 0 {
            errors.push("worker_threads must be > 0".to_string());
        }

        if self.worker_threads > 1024 {
            errors.push("worker_threads is unreasonably high (> 1024)".to_string());
        }

        if self.max_blocking_threads == 0 {
            errors.push("max_blocking_threads must be > 0".to_string());
        }

        if self.thread_stack_size < 128 * 1024 {
            errors.push("thread_stack_size too small (< 128 KB)".to_string());
        }

        if self.thread_stack_size > 64 * 1024 * 1024 {
            errors.push("thread_stack_size too large (> 64 MB)".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level for the entire application; `RUST_LOG` takes precedence.
    ///
    /// **Default:** `Info`
    pub level: LogLevel,

    /// Emit one JSON object per event.
    ///
    /// **Default:** `false`
    pub json_format: bool,

    /// Enable ANSI color codes in logs.
    ///
    /// **Default:** `true`
    pub enable_colors: bool,

    /// Include source file and line number in logs.
    ///
    /// **Default:** `true`
    pub include_file_line: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            enable_colors: true,
            include_file_line: true,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}
