//! nbdeploy
//!
//! Provision a self-hosted NetBird control plane on Hetzner Cloud and wait
//! for it to come up.

use std::process::ExitCode;

use clap::Parser;
use nbdeploy_common::telemetry::{init_telemetry, TelemetryConfig};

use nbdeploy_cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_telemetry(TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    }) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    // The TLS probe and reqwest both need a process-wide crypto provider
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    match cli.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
