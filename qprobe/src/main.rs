use anyhow::Context;
use clap::Parser;
use qprobe::config::{self, CliArgs};
use qprobe::net::bind_udp_socket;
use qprobe::probe::Probe;
use qprobe::{runtime, telemetry};
use std::process::ExitCode;
use tracing::{info, warn};

fn main() -> anyhow::Result<ExitCode> {
    let cli = CliArgs::parse();

    if cli.print_default_config {
        println!("{}", config::loader::default_config_toml()?);
        return Ok(ExitCode::SUCCESS);
    }

    let config = config::load_config(&cli)?;
    if cli.validate {
        println!("Configuration is valid");
        return Ok(ExitCode::SUCCESS);
    }

    telemetry::init_logging(&config.logging).context("failed to initialize logging")?;
    info!(config_path = %cli.config, "Configuration loaded successfully");

    let server = config.connection.server_addr()?;
    let tokio_runtime =
        runtime::create_runtime(&config.runtime).context("failed to create tokio runtime")?;

    let outcome = tokio_runtime.block_on(async {
        let socket = bind_udp_socket(server)?;
        let probe = Probe::from_settings(&config.connection);
        info!(
            %server,
            sni = config.connection.server_name(),
            version = format_args!("0x{:08x}", probe.version),
            "probing for version negotiation"
        );

        tokio::select! {
            outcome = probe.run(&socket) => outcome.map(Some),
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl+C")?;
                warn!("Interrupted");
                Ok(None)
            }
        }
    })?;

    tokio_runtime.shutdown_timeout(std::time::Duration::from_secs(1));

    Ok(match outcome {
        Some(outcome) if outcome.selected.is_some() => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}
