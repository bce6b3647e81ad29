//! Deploy command - Provision a NetBird control plane end to end
//!
//! Usage: nbdeploy deploy [-c nbdeploy.yaml]
//!
//! Steps:
//! 1. Validate the deploy file and read the IdP secret from the environment
//! 2. Render the stack with stored (or freshly generated) secrets
//! 3. Ensure the firewall and create the server, reusing one that exists
//! 4. Wait for the server to run, then for SSH to accept the key
//! 5. Upload the stack and start it with Docker Compose
//! 6. Wait for the services and the TLS certificate concurrently
//!
//! Re-running against a finished deployment re-checks every stage and
//! changes nothing.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use nbdeploy_common::template::{RenderedFile, StackRenderer, STACK_SERVICES};
use nbdeploy_common::{expand_home, DeployConfig, DeploymentTarget, REMOTE_STACK_DIR};
use nbdeploy_hcloud::{CloudProvider, HcloudClient};
use nbdeploy_readiness::actions::{server_request, InstallStack, ProvisionServer};
use nbdeploy_readiness::probes::{
    ServerRunningProbe, ServicesRunningProbe, SshReadyProbe, TlsCertProbe,
};
use nbdeploy_readiness::{stage, EscalationAction, OpenSsh, Plan, RemoteShell, StageDescriptor};
use tracing::info;

use super::{
    cancel_on_ctrl_c, config_path, finish, idp_client_secret, load_config, orchestrator,
    CommandErrorExt, StagePolicies,
};
use crate::state::SecretStore;
use crate::Result;

/// Provision the server and wait until NetBird serves HTTPS
#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Deploy file
    #[arg(short = 'c', long, env = "NBDEPLOY_CONFIG", default_value = "nbdeploy.yaml")]
    pub config: PathBuf,

    /// Hetzner Cloud API token
    #[arg(long, env = "HCLOUD_TOKEN", hide_env_values = true)]
    pub hcloud_token: String,

    /// Server name (overrides server.name)
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// SSH private key for logging in (overrides server.ssh_identity)
    #[arg(short = 'i', long)]
    pub identity: Option<PathBuf>,
}

impl DeployArgs {
    /// Apply command-line overrides on top of the deploy file
    fn apply_overrides(&self, config: &mut DeployConfig) -> Result<()> {
        if let Some(name) = &self.name {
            config.server.name = name.clone();
        }
        if let Some(identity) = &self.identity {
            config.server.ssh_identity = Some(identity.clone());
        }
        config.validate()?;
        Ok(())
    }
}

pub async fn run(args: DeployArgs, interactive: bool) -> Result<()> {
    let mut config = load_config(&config_path(&args.config))?;
    args.apply_overrides(&mut config)?;

    let idp_secret = idp_client_secret(&config)?;
    let secrets = SecretStore::default_location()?.load_or_generate(&config.server.name, &idp_secret)?;
    let files = StackRenderer::new()?.render(&config.stack, &secrets)?;
    let policies = StagePolicies::from_config(&config.readiness)?;

    let cloud: Arc<dyn CloudProvider> = Arc::new(HcloudClient::new(args.hcloud_token)?);
    let shell: Arc<dyn RemoteShell> = Arc::new(OpenSsh::new());
    let target = deployment_target(&config);
    let plan = deploy_plan(&config, &policies, cloud, shell, files)?;

    info!(
        server = %config.server.name,
        domain = %config.stack.domain,
        steps = ?plan.describe(),
        "Deploying NetBird"
    );

    let cancel = cancel_on_ctrl_c();
    let result = orchestrator(interactive).run(plan, &target, &cancel).await;
    finish(&result)?;

    println!("\nNetBird is up at https://{}", config.stack.domain);
    Ok(())
}

/// Target for a server that may not exist yet
pub fn deployment_target(config: &DeployConfig) -> DeploymentTarget {
    let target = DeploymentTarget::new(&config.server.name)
        .domain(&config.stack.domain)
        .ssh_user(&config.server.ssh_user);
    match &config.server.ssh_identity {
        Some(path) => target.ssh_identity(expand_home(path)),
        None => target,
    }
}

/// Full deployment plan for a deploy file
pub fn deploy_plan(
    config: &DeployConfig,
    policies: &StagePolicies,
    cloud: Arc<dyn CloudProvider>,
    shell: Arc<dyn RemoteShell>,
    files: Vec<RenderedFile>,
) -> Result<Plan> {
    let mut provision = ProvisionServer::new(cloud.clone(), server_request(&config.server));
    if let Some(firewall) = &config.server.firewall {
        provision = provision.firewall(firewall);
    }

    Ok(Plan::new()
        .run(provision)
        .wait(StageDescriptor::new(
            stage::SERVER_BOOT,
            ServerRunningProbe::new(cloud),
            policies.server_boot.clone(),
        ))
        // The install step retries its own SSH commands, so a marginal
        // ssh-ready timeout is not fatal
        .wait(
            StageDescriptor::new(
                stage::SSH_READY,
                SshReadyProbe::new(shell.clone()),
                policies.ssh_ready.clone(),
            )
            .on_timeout(EscalationAction::WarnAndContinue),
        )
        .run(InstallStack::new(shell.clone(), files, REMOTE_STACK_DIR))
        .wait_all(vec![
            services_stage(shell, policies),
            tls_stage(policies)?.on_timeout(EscalationAction::PromptOperator),
        ]))
}

/// Compose services stage
pub fn services_stage(shell: Arc<dyn RemoteShell>, policies: &StagePolicies) -> StageDescriptor {
    StageDescriptor::new(
        stage::SERVICES,
        ServicesRunningProbe::new(shell, REMOTE_STACK_DIR, STACK_SERVICES.iter().copied()),
        policies.services.clone(),
    )
}

/// Certificate stage
pub fn tls_stage(policies: &StagePolicies) -> Result<StageDescriptor> {
    Ok(StageDescriptor::new(
        stage::TLS_CERT,
        TlsCertProbe::new().cmd_err()?,
        policies.tls_cert.clone(),
    ))
}
