//! Configuration loading and parsing.
//!
//! This module handles loading configuration from files, environment variables,
//! and command-line arguments, with proper precedence handling.

use anyhow::{Context, Result};
use clap::Parser;
use config::Config as ConfigLoader;
use std::path::Path;

use super::ProbeConfig;

/// Prefix of environment overrides, e.g. `QPROBE_CONNECTION__PORT=443`
pub const ENV_PREFIX: &str = "QPROBE";

/// Command-line interface of the probe.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, short = 'c', default_value = "qprobe.toml")]
    pub config: String,

    /// Server host (overrides config file)
    #[arg(long)]
    pub host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long)]
    pub port: Option<u16>,

    /// Connect over IPv6 (overrides config file)
    #[arg(long)]
    pub ipv6: bool,

    /// Log level (overrides config file)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Print default configuration and exit
    #[arg(long)]
    pub print_default_config: bool,
}

/// Load and parse the probe configuration.
///
/// Precedence, lowest first:
/// 1. Default values
/// 2. Configuration file
/// 3. Environment variables (`QPROBE_` prefix, `__` between sections)
/// 4. Command-line arguments
///
/// # Errors
///
/// Returns an error if:
/// - Configuration file cannot be read or parsed
/// - An environment override has the wrong type
/// - Validation fails
pub fn load_config(cli: &CliArgs) -> Result<ProbeConfig> {
    let mut config = load_config_file(&cli.config)?;
    apply_env_overrides(&mut config)?;
    apply_cli_overrides(&mut config, cli);

    config.validate().map_err(|errors| {
        anyhow::anyhow!("Configuration validation failed:\n{}", errors.join("\n"))
    })?;

    Ok(config)
}

/// Load configuration from a TOML file; a missing file yields the defaults.
pub fn load_config_file(path: impl AsRef<Path>) -> Result<ProbeConfig> {
    let path = path.as_ref();

    if !path.exists() {
        tracing::warn!(
            config_path = %path.display(),
            "Configuration file not found, using defaults"
        );
        return Ok(ProbeConfig::default());
    }

    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&config_str)
        .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
}

/// Apply environment variable overrides.
///
/// Examples:
/// - `QPROBE_CONNECTION__HOST=192.0.2.1`
/// - `QPROBE_AGENTS__SUPPRESS_ACKS=true`
/// - `QPROBE_LOGGING__LEVEL=debug`
pub fn apply_env_overrides(config: &mut ProbeConfig) -> Result<()> {
    let env_config = ConfigLoader::builder()
        .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()
        .context("Failed to load environment variables")?;
    apply_overrides(config, &env_config)
}

/// Apply the known keys present in `source`
pub(crate) fn apply_overrides(config: &mut ProbeConfig, source: &ConfigLoader) -> Result<()> {
    if let Ok(host) = source.get_string("connection.host") {
        config.connection.host = host;
    }
    if let Ok(port) = source.get_int("connection.port") {
        config.connection.port =
            u16::try_from(port).with_context(|| format!("connection.port out of range: {}", port))?;
    }
    if let Ok(ipv6) = source.get_bool("connection.ipv6") {
        config.connection.ipv6 = ipv6;
    }
    if let Ok(version) = source.get_int("connection.initial_version") {
        config.connection.initial_version = u32::try_from(version)
            .with_context(|| format!("connection.initial_version out of range: {}", version))?;
    }
    if let Ok(alpn) = source.get_string("connection.alpn") {
        config.connection.alpn = Some(alpn);
    }
    if let Ok(suppress) = source.get_bool("agents.suppress_acks") {
        config.agents.suppress_acks = suppress;
    }
    if let Ok(threshold) = source.get_int("agents.retransmit_threshold_ms") {
        config.agents.retransmit_threshold_ms = u64::try_from(threshold)
            .with_context(|| format!("agents.retransmit_threshold_ms out of range: {}", threshold))?;
    }
    if let Ok(level) = source.get_string("logging.level") {
        match level.parse() {
            Ok(parsed) => config.logging.level = parsed,
            Err(e) => tracing::warn!(error = %e, "Invalid log level in environment, ignoring"),
        }
    }
    if let Ok(json) = source.get_bool("logging.json_format") {
        config.logging.json_format = json;
    }

    Ok(())
}

/// Apply command-line argument overrides.
pub fn apply_cli_overrides(config: &mut ProbeConfig, cli: &CliArgs) {
    if let Some(ref host) = cli.host {
        config.connection.host = host.clone();
    }

    if let Some(port) = cli.port {
        config.connection.port = port;
    }

    if cli.ipv6 {
        config.connection.ipv6 = true;
    }

    if let Some(ref level_str) = cli.log_level {
        if let Ok(level) = level_str.parse() {
            config.logging.level = level;
        } else {
            tracing::warn!(level = %level_str, "Invalid log level specified, ignoring");
        }
    }
}

/// The default configuration in TOML format.
pub fn default_config_toml() -> Result<String> {
    toml::to_string_pretty(&ProbeConfig::default()).context("Failed to serialize default config")
}
