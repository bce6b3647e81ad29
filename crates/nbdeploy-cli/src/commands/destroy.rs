//! Destroy command - Delete the server
//!
//! Usage: nbdeploy destroy --name <server> [--yes]
//!
//! The firewall is left in place since other servers may share it. Stored
//! stack secrets are kept unless `--forget-secrets` is given, so a
//! redeploy with the same name renders identical configuration.

use std::sync::Arc;

use clap::Args;
use nbdeploy_hcloud::{CloudProvider, HcloudClient, Server};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use crate::state::SecretStore;
use crate::{Error, Result};

/// Delete a NetBird server
#[derive(Args, Debug)]
pub struct DestroyArgs {
    /// Server name
    #[arg(short = 'n', long)]
    pub name: String,

    /// Skip confirmation prompt
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,

    /// Also delete the stored stack secrets for this server
    #[arg(long)]
    pub forget_secrets: bool,

    /// Hetzner Cloud API token
    #[arg(long, env = "HCLOUD_TOKEN", hide_env_values = true)]
    pub hcloud_token: String,
}

pub async fn run(args: DestroyArgs, interactive: bool) -> Result<()> {
    let cloud: Arc<dyn CloudProvider> = Arc::new(HcloudClient::new(args.hcloud_token.clone())?);
    let server = lookup(cloud.as_ref(), &args.name).await?;

    if !args.yes {
        if !interactive {
            return Err(Error::validation(
                "refusing to delete without confirmation; pass --yes",
            ));
        }
        println!(
            "This will permanently delete server {} (id {}, {}).",
            server.name,
            server.id,
            server
                .ipv4()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "no address".to_string())
        );
        print!("Are you sure? [y/N] ");
        tokio::io::stdout().flush().await?;

        let mut input = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut input)
            .await?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    cloud.delete_server(server.id).await?;
    info!(server = %server.name, id = server.id, "Server deleted");

    if args.forget_secrets && SecretStore::default_location()?.forget(&args.name)? {
        info!(server = %args.name, "Stored secrets removed");
    }
    Ok(())
}

/// Find the server to delete by name
pub async fn lookup(cloud: &dyn CloudProvider, name: &str) -> Result<Server> {
    cloud
        .find_server(name)
        .await?
        .ok_or_else(|| Error::ServerNotFound {
            name: name.to_string(),
        })
}
