//! Compose services probe

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nbdeploy_common::DeploymentTarget;

use crate::probe::{ConditionProbe, ProbeResult};
use crate::remote::{manual_ssh_command, shell_quote, RemoteShell, SshError};

/// Ready once every expected Docker Compose service reports `running`
pub struct ServicesRunningProbe {
    shell: Arc<dyn RemoteShell>,
    stack_dir: String,
    expected: Vec<String>,
    timeout: Duration,
}

impl ServicesRunningProbe {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        stack_dir: impl Into<String>,
        expected: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            shell,
            stack_dir: stack_dir.into(),
            expected: expected.into_iter().map(Into::into).collect(),
            timeout: Duration::from_secs(15),
        }
    }

    fn list_command(&self) -> String {
        format!(
            "cd {} && docker compose ps --services --filter status=running",
            shell_quote(&self.stack_dir)
        )
    }
}

#[async_trait]
impl ConditionProbe for ServicesRunningProbe {
    async fn check(&self, target: &DeploymentTarget) -> ProbeResult {
        let output = match self.shell.exec(target, &self.list_command(), self.timeout).await {
            Ok(output) => output,
            Err(SshError::CommandFailed { stderr, .. }) => {
                return ProbeResult::pending(format!("docker compose not answering: {}", stderr))
            }
            Err(e) if e.is_retryable() => return ProbeResult::pending(e.to_string()),
            Err(e) => return ProbeResult::permanent(e.to_string()),
        };

        let running: BTreeSet<&str> = output.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        let missing: Vec<&str> = self
            .expected
            .iter()
            .map(String::as_str)
            .filter(|svc| !running.contains(svc))
            .collect();

        if missing.is_empty() {
            ProbeResult::ready(format!("{}/{} services running", self.expected.len(), self.expected.len()))
        } else {
            ProbeResult::pending(format!(
                "{}/{} services running, waiting for {}",
                self.expected.len() - missing.len(),
                self.expected.len(),
                missing.join(", ")
            ))
        }
    }

    fn manual_command(&self, target: &DeploymentTarget) -> String {
        manual_ssh_command(
            target,
            Some(&format!("cd {} && docker compose ps", self.stack_dir)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemoteShell;

    const EXPECTED: [&str; 3] = ["caddy", "management", "signal"];

    fn target() -> DeploymentTarget {
        DeploymentTarget::with_address("netbird", "192.0.2.10".parse().unwrap())
    }

    fn probe_with_output(result: fn() -> Result<String, SshError>) -> ServicesRunningProbe {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_exec()
            .withf(|_, cmd, _| cmd.contains("docker compose ps --services"))
            .returning(move |_, _, _| result());
        ServicesRunningProbe::new(Arc::new(shell), "/opt/netbird", EXPECTED)
    }

    #[tokio::test]
    async fn all_services_running_is_ready() {
        let probe = probe_with_output(|| Ok("caddy\nmanagement\nsignal\ncoturn\n".to_string()));
        let result = probe.check(&target()).await;
        assert!(result.is_ready());
        assert_eq!(result.detail, "3/3 services running");
    }

    #[tokio::test]
    async fn missing_services_are_named() {
        let probe = probe_with_output(|| Ok("caddy\n".to_string()));
        let result = probe.check(&target()).await;
        assert!(result.is_retryable());
        assert_eq!(result.detail, "1/3 services running, waiting for management, signal");
    }

    #[tokio::test]
    async fn compose_failure_is_retryable() {
        let probe = probe_with_output(|| {
            Err(SshError::CommandFailed {
                status: 1,
                stderr: "no configuration file provided: not found".into(),
            })
        });
        let result = probe.check(&target()).await;
        assert!(result.is_retryable());
    }

    #[tokio::test]
    async fn host_key_change_is_permanent() {
        let probe = probe_with_output(|| Err(SshError::HostKeyChanged("192.0.2.10".into())));
        assert!(!probe.check(&target()).await.is_retryable());
    }

    #[test]
    fn manual_command_runs_compose_ps() {
        let probe = ServicesRunningProbe::new(Arc::new(MockRemoteShell::new()), "/opt/netbird", EXPECTED);
        assert_eq!(
            probe.manual_command(&target()),
            "ssh root@192.0.2.10 'cd /opt/netbird && docker compose ps'"
        );
    }
}
