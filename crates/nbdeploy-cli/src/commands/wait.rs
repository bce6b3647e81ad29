//! Wait command - Re-check readiness of an existing host
//!
//! Usage: nbdeploy wait --ip <addr> [--domain <domain>]
//!
//! Runs the ssh-ready stage, then the services and TLS stages together.
//! Nothing on the host is changed, so it is safe to run at any time.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use nbdeploy_common::{expand_home, DeployConfig, DeploymentTarget, DEFAULT_SSH_USER};
use nbdeploy_readiness::probes::SshReadyProbe;
use nbdeploy_readiness::{stage, OpenSsh, Plan, RemoteShell, StageDescriptor};
use tracing::info;

use super::deploy::{services_stage, tls_stage};
use super::{cancel_on_ctrl_c, config_path, finish, load_config, orchestrator, StagePolicies};
use crate::Result;

/// Wait for an existing NetBird host
#[derive(Args, Debug)]
pub struct WaitArgs {
    /// Public address of the host
    #[arg(long)]
    pub ip: IpAddr,

    /// Domain the dashboard is served on; enables the TLS stage
    #[arg(long)]
    pub domain: Option<String>,

    /// Server name shown in output (defaults to server.name)
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// SSH login user (defaults to server.ssh_user, then root)
    #[arg(long)]
    pub ssh_user: Option<String>,

    /// SSH private key for logging in
    #[arg(short = 'i', long)]
    pub identity: Option<PathBuf>,

    /// Deploy file supplying defaults and readiness overrides
    #[arg(short = 'c', long, env = "NBDEPLOY_CONFIG")]
    pub config: Option<PathBuf>,
}

impl WaitArgs {
    /// Resolve the target: flags first, then the deploy file, then defaults
    fn target(&self, config: Option<&DeployConfig>) -> DeploymentTarget {
        let name = self
            .name
            .clone()
            .or_else(|| config.map(|c| c.server.name.clone()))
            .unwrap_or_else(|| "netbird".to_string());
        let user = self
            .ssh_user
            .clone()
            .or_else(|| config.map(|c| c.server.ssh_user.clone()))
            .unwrap_or_else(|| DEFAULT_SSH_USER.to_string());
        let domain = self
            .domain
            .clone()
            .or_else(|| config.map(|c| c.stack.domain.clone()));
        let identity = self
            .identity
            .clone()
            .or_else(|| config.and_then(|c| c.server.ssh_identity.clone()));

        let mut target = DeploymentTarget::with_address(name, self.ip).ssh_user(user);
        if let Some(domain) = domain {
            target = target.domain(domain);
        }
        if let Some(identity) = identity {
            target = target.ssh_identity(expand_home(&identity));
        }
        target
    }
}

pub async fn run(args: WaitArgs, interactive: bool) -> Result<()> {
    let config = match &args.config {
        Some(path) => Some(load_config(&config_path(path))?),
        None => None,
    };
    let policies = match &config {
        Some(config) => StagePolicies::from_config(&config.readiness)?,
        None => StagePolicies::default(),
    };

    let target = args.target(config.as_ref());
    let shell: Arc<dyn RemoteShell> = Arc::new(OpenSsh::new());
    let plan = wait_plan(&target, &policies, shell)?;
    info!(
        server = %target.server_name(),
        address = %args.ip,
        steps = ?plan.describe(),
        "Checking deployment"
    );

    let cancel = cancel_on_ctrl_c();
    let result = orchestrator(interactive).run(plan, &target, &cancel).await;
    finish(&result)
}

/// Stages that apply to a host that is already running
pub fn wait_plan(
    target: &DeploymentTarget,
    policies: &StagePolicies,
    shell: Arc<dyn RemoteShell>,
) -> Result<Plan> {
    let mut concurrent = vec![services_stage(shell.clone(), policies)];
    if target.domain_name().is_some() {
        concurrent.push(tls_stage(policies)?);
    }

    Ok(Plan::new()
        .wait(StageDescriptor::new(
            stage::SSH_READY,
            SshReadyProbe::new(shell),
            policies.ssh_ready.clone(),
        ))
        .wait_all(concurrent))
}
