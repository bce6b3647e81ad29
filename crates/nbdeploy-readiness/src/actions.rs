//! Deploy actions run between readiness stages

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nbdeploy_common::template::RenderedFile;
use nbdeploy_common::{DeploymentTarget, ServerSpec};
use nbdeploy_hcloud::types::FirewallRef;
use nbdeploy_hcloud::{CloudProvider, CreateServerRequest, FirewallRule, HcloudError};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backoff::{retry_with_backoff, BackoffConfig, RetryError};
use crate::orchestrator::DeployAction;
use crate::remote::{shell_quote, RemoteShell, SshError};
use crate::{Error, Result};

/// Build the create request for a server spec
pub fn server_request(spec: &ServerSpec) -> CreateServerRequest {
    let mut request = CreateServerRequest::new(&spec.name);
    request.server_type = spec.server_type.clone();
    request.image = spec.image.clone();
    request.location = spec.location.clone();
    request.ssh_keys = spec.ssh_keys.clone();
    request
}

fn flatten<E>(action: &str, err: RetryError<E>) -> Error
where
    Error: From<E>,
{
    match err {
        RetryError::Failed(e) => Error::from(e),
        RetryError::Cancelled => Error::action(action, "cancelled"),
    }
}

/// Create the server, or adopt an existing one with the same name
pub struct ProvisionServer {
    cloud: Arc<dyn CloudProvider>,
    request: CreateServerRequest,
    firewall: Option<String>,
    backoff: BackoffConfig,
}

impl ProvisionServer {
    pub fn new(cloud: Arc<dyn CloudProvider>, request: CreateServerRequest) -> Self {
        Self {
            cloud,
            request,
            firewall: None,
            backoff: BackoffConfig::default(),
        }
    }

    /// Attach a firewall, creating it with the NetBird port set if needed
    pub fn firewall(mut self, name: impl Into<String>) -> Self {
        self.firewall = Some(name.into());
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl DeployAction for ProvisionServer {
    fn name(&self) -> String {
        "create-server".to_string()
    }

    async fn run(&self, target: &DeploymentTarget, cancel: &CancellationToken) -> Result<()> {
        let name = self.request.name.as_str();
        if name != target.server_name() {
            return Err(Error::action(
                self.name(),
                format!(
                    "request is for {} but the deployment targets {}",
                    name,
                    target.server_name()
                ),
            ));
        }

        let existing = retry_with_backoff(
            &self.backoff,
            "find_server",
            cancel,
            HcloudError::is_retryable,
            || self.cloud.find_server(name),
        )
        .await
        .map_err(|e| flatten("create-server", e))?;
        if let Some(server) = existing {
            info!(server = %name, id = server.id, status = %server.status, "Server already exists, reusing it");
            target.record_server_id(server.id)?;
            return Ok(());
        }

        let mut request = self.request.clone();
        if let Some(firewall) = &self.firewall {
            let rules = FirewallRule::netbird_defaults();
            let fw = retry_with_backoff(
                &self.backoff,
                "ensure_firewall",
                cancel,
                HcloudError::is_retryable,
                || self.cloud.ensure_firewall(firewall, &rules),
            )
            .await
            .map_err(|e| flatten("create-server", e))?;
            request.firewalls.push(FirewallRef { firewall: fw.id });
        }

        // A create whose response was lost may still have succeeded, so every
        // retry looks the name up again before creating
        let attempted = AtomicBool::new(false);
        let (attempted, request, cloud) = (&attempted, &request, self.cloud.as_ref());
        let server = retry_with_backoff(
            &self.backoff,
            "create_server",
            cancel,
            HcloudError::is_retryable,
            || async move {
                if attempted.swap(true, Ordering::SeqCst) {
                    match cloud.find_server(name).await {
                        Ok(Some(server)) => {
                            info!(server = %name, id = server.id, "Earlier create went through, adopting server");
                            return Ok(server);
                        }
                        Ok(None) => {}
                        Err(e) => return Err(e),
                    }
                }
                cloud.create_server(request).await
            },
        )
        .await
        .map_err(|e| flatten("create-server", e))?;
        info!(server = %server.name, id = server.id, "Server created");
        target.record_server_id(server.id)?;
        Ok(())
    }
}

/// Script that installs Docker when it is missing
const ENSURE_DOCKER: &str =
    "command -v docker >/dev/null 2>&1 || (curl -fsSL https://get.docker.com | sh)";

/// Upload the rendered stack and start it with Docker Compose
pub struct InstallStack {
    shell: Arc<dyn RemoteShell>,
    files: Vec<RenderedFile>,
    stack_dir: String,
    backoff: BackoffConfig,
    command_timeout: Duration,
}

impl InstallStack {
    pub fn new(shell: Arc<dyn RemoteShell>, files: Vec<RenderedFile>, stack_dir: impl Into<String>) -> Self {
        Self {
            shell,
            files,
            stack_dir: stack_dir.into(),
            backoff: BackoffConfig::default(),
            command_timeout: Duration::from_secs(10 * 60),
        }
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    async fn exec(
        &self,
        target: &DeploymentTarget,
        cancel: &CancellationToken,
        label: &str,
        command: &str,
    ) -> Result<String> {
        retry_with_backoff(&self.backoff, label, cancel, SshError::is_retryable, || {
            self.shell.exec(target, command, self.command_timeout)
        })
        .await
        .map_err(|e| flatten("install-stack", e))
    }
}

#[async_trait]
impl DeployAction for InstallStack {
    fn name(&self) -> String {
        "install-stack".to_string()
    }

    async fn run(&self, target: &DeploymentTarget, cancel: &CancellationToken) -> Result<()> {
        let dir = shell_quote(&self.stack_dir);

        // The first command doubles as the connection check after a marginal
        // ssh-ready stage, so it gets the retries
        self.exec(target, cancel, "ensure_docker", ENSURE_DOCKER).await?;
        self.exec(target, cancel, "create_stack_dir", &format!("mkdir -p {}", dir))
            .await?;

        for file in &self.files {
            let path = format!("{}/{}", self.stack_dir.trim_end_matches('/'), file.name);
            retry_with_backoff(&self.backoff, "upload", cancel, SshError::is_retryable, || {
                self.shell.write_file(target, &path, &file.contents)
            })
            .await
            .map_err(|e| flatten("install-stack", e))?;
            info!(path = %path, bytes = file.contents.len(), "Uploaded");
        }

        self.exec(
            target,
            cancel,
            "compose_up",
            &format!("cd {} && docker compose pull --quiet && docker compose up -d", dir),
        )
        .await?;
        info!(server = %target.server_name(), dir = %self.stack_dir, "Stack started");
        Ok(())
    }
}
