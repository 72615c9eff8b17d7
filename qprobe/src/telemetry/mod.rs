//! # Logging
//!
//! Structured logging for the probe. Agents log through `tracing` macros
//! with structured fields (`space = ?space, pn = pn`); this module installs
//! the subscriber that renders them.
//!
//! `RUST_LOG` overrides the configured level, so a single agent can be
//! traced without touching the configuration file:
//!
//! ```text
//! RUST_LOG=info,qprobe::agents::sender=trace qprobe -c qprobe.toml
//! ```

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber
///
/// # Errors
///
/// Fails when the filter directive is invalid or a subscriber is already
/// installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.level.to_string()))
        .context("Invalid log filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.include_file_line)
                    .with_line_number(config.include_file_line),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(config.enable_colors)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(config.include_file_line)
                    .with_line_number(config.include_file_line),
            )
            .try_init()
    };
    result.context("Logging already initialized")?;

    tracing::info!(level = %config.level, json = config.json_format, "Logging initialized");
    Ok(())
}
