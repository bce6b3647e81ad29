//! nbdeploy CLI library

pub mod commands;
pub mod error;
pub mod state;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};
use nbdeploy_common::telemetry::LogFormat;

/// nbdeploy - NetBird on Hetzner Cloud
#[derive(Parser, Debug)]
#[command(name = "nbdeploy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log output format: text or json
    #[arg(long, global = true, env = "NBDEPLOY_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Never prompt; stages that would ask the operator abort instead
    #[arg(long, global = true, env = "NBDEPLOY_NON_INTERACTIVE")]
    pub non_interactive: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the server, install the stack and wait until it serves HTTPS
    Deploy(commands::deploy::DeployArgs),
    /// Wait for an existing host to become ready
    Wait(commands::wait::WaitArgs),
    /// Render the stack configuration to a local directory
    Render(commands::render::RenderArgs),
    /// Delete the server
    Destroy(commands::destroy::DestroyArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let interactive = commands::is_interactive(self.non_interactive);
        match self.command {
            Commands::Deploy(args) => commands::deploy::run(args, interactive).await,
            Commands::Wait(args) => commands::wait::run(args, interactive).await,
            Commands::Render(args) => commands::render::run(args),
            Commands::Destroy(args) => commands::destroy::run(args, interactive).await,
        }
    }
}
