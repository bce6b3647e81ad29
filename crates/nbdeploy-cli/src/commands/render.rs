//! Render command - Write the stack configuration locally
//!
//! Usage: nbdeploy render --out <dir>
//!
//! Produces exactly the files `deploy` would upload, using the same stored
//! secrets, so they can be reviewed or applied by hand.

use std::path::{Path, PathBuf};

use clap::Args;
use nbdeploy_common::template::{write_rendered, StackRenderer};
use nbdeploy_common::DeployConfig;
use tracing::info;

use super::{config_path, idp_client_secret, load_config};
use crate::state::SecretStore;
use crate::Result;

/// Render configuration files without deploying
#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Deploy file
    #[arg(short = 'c', long, env = "NBDEPLOY_CONFIG", default_value = "nbdeploy.yaml")]
    pub config: PathBuf,

    /// Output directory
    #[arg(short = 'o', long)]
    pub out: PathBuf,
}

pub fn run(args: RenderArgs) -> Result<()> {
    let config = load_config(&config_path(&args.config))?;
    let idp_secret = idp_client_secret(&config)?;
    let store = SecretStore::default_location()?;

    let names = render_to(&config, &store, &idp_secret, &args.out)?;
    for name in &names {
        println!("{}", args.out.join(name).display());
    }
    Ok(())
}

/// Render the stack for `config` into `out`, returning the file names written
pub fn render_to(
    config: &DeployConfig,
    store: &SecretStore,
    idp_secret: &str,
    out: &Path,
) -> Result<Vec<String>> {
    let secrets = store.load_or_generate(&config.server.name, idp_secret)?;
    let files = StackRenderer::new()?.render(&config.stack, &secrets)?;
    write_rendered(out, &files)?;
    info!(dir = %out.display(), files = files.len(), "Rendered stack");
    Ok(files.into_iter().map(|f| f.name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::sample_config;

    #[test]
    fn writes_every_stack_file() {
        let state = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let store = SecretStore::at(state.path());

        let names = render_to(&sample_config(), &store, "idp-secret", out.path()).unwrap();

        for expected in ["docker-compose.yml", "Caddyfile", "management.json", "turnserver.conf"] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
            assert!(out.path().join(expected).exists(), "{} not written", expected);
        }
    }

    #[test]
    fn rerender_is_stable() {
        let state = tempfile::tempdir().unwrap();
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let store = SecretStore::at(state.path());
        let config = sample_config();

        render_to(&config, &store, "idp-secret", first.path()).unwrap();
        render_to(&config, &store, "idp-secret", second.path()).unwrap();

        let read = |dir: &Path| std::fs::read_to_string(dir.join("turnserver.conf")).unwrap();
        assert_eq!(read(first.path()), read(second.path()));
    }

    #[test]
    fn output_directory_is_created() {
        let state = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let nested = out.path().join("netbird").join("config");

        render_to(
            &sample_config(),
            &SecretStore::at(state.path()),
            "idp-secret",
            &nested,
        )
        .unwrap();
        assert!(nested.join("Caddyfile").exists());
    }
}
