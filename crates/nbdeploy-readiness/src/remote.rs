//! Remote command execution over the system `ssh` binary
//!
//! `ssh` runs in batch mode so it never blocks on a password or host key
//! prompt. Its failures only show up as exit code 255 plus a line on
//! stderr, so [`classify_failure`] turns that text into an [`SshError`] the
//! probes can act on.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use nbdeploy_common::DeploymentTarget;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Exit status `ssh` uses for its own errors, as opposed to the remote command's
const SSH_ERROR_STATUS: i32 = 255;

/// Failure running a command over SSH
#[derive(Debug, Error)]
pub enum SshError {
    #[error("address of {0} is not known yet")]
    NoAddress(String),

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection timed out")]
    ConnectionTimedOut,

    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("host key for {0} changed; remove the stale entry with `ssh-keygen -R {0}`")]
    HostKeyChanged(String),

    #[error("remote command exited with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },

    #[error("ssh did not finish within {0:?}")]
    Timeout(Duration),

    #[error("failed to run ssh: {0}")]
    Spawn(#[from] std::io::Error),
}

impl SshError {
    /// Check if retrying could succeed.
    ///
    /// Auth failures are retryable: cloud-init installs the key a few seconds
    /// after sshd starts. A changed host key never heals by waiting.
    pub fn is_retryable(&self) -> bool {
        match self {
            SshError::ConnectionRefused
            | SshError::ConnectionTimedOut
            | SshError::Unreachable(_)
            | SshError::AuthFailed(_)
            | SshError::CommandFailed { .. }
            | SshError::Timeout(_) => true,
            SshError::NoAddress(_) | SshError::HostKeyChanged(_) | SshError::Spawn(_) => false,
        }
    }
}

/// Classify a failed `ssh` invocation from its exit status and stderr
pub fn classify_failure(host: &str, status: i32, stderr: &str) -> SshError {
    let stderr = stderr.trim();
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("remote host identification has changed")
        || lower.contains("host key verification failed")
    {
        SshError::HostKeyChanged(host.to_string())
    } else if lower.contains("connection refused") {
        SshError::ConnectionRefused
    } else if lower.contains("timed out") {
        SshError::ConnectionTimedOut
    } else if lower.contains("permission denied") || lower.contains("too many authentication failures") {
        SshError::AuthFailed(last_line(stderr))
    } else if lower.contains("no route to host")
        || lower.contains("network is unreachable")
        || lower.contains("connection reset")
        || lower.contains("connection closed")
    {
        SshError::Unreachable(last_line(stderr))
    } else if status == SSH_ERROR_STATUS {
        SshError::Unreachable(last_line(stderr))
    } else {
        SshError::CommandFailed {
            status,
            stderr: last_line(stderr),
        }
    }
}

fn last_line(text: &str) -> String {
    text.lines().last().unwrap_or_default().trim().to_string()
}

/// Runs commands on the deployment host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run a command and return its stdout
    async fn exec(
        &self,
        target: &DeploymentTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<String, SshError>;

    /// Write `contents` to `remote_path`, replacing any existing file
    async fn write_file(
        &self,
        target: &DeploymentTarget,
        remote_path: &str,
        contents: &str,
    ) -> Result<(), SshError>;
}

/// [`RemoteShell`] backed by the OpenSSH client
#[derive(Debug, Clone)]
pub struct OpenSsh {
    program: PathBuf,
    connect_timeout: Duration,
}

impl Default for OpenSsh {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ssh"),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl OpenSsh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the TCP connect phase of each invocation
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn command(&self, target: &DeploymentTarget, remote: &str) -> Result<Command, SshError> {
        let destination = target
            .ssh_destination()
            .ok_or_else(|| SshError::NoAddress(target.server_name().to_string()))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            ));
        if let Some(identity) = target.identity_file() {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(destination)
            .arg(remote)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl RemoteShell for OpenSsh {
    async fn exec(
        &self,
        target: &DeploymentTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<String, SshError> {
        let mut cmd = self.command(target, command)?;
        cmd.stdin(Stdio::null());
        debug!(server = %target.server_name(), command = %command, "Running remote command");

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| SshError::Timeout(timeout))??;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let host = target
            .address()
            .map(|a| a.to_string())
            .unwrap_or_else(|| target.server_name().to_string());
        Err(classify_failure(
            &host,
            output.status.code().unwrap_or(SSH_ERROR_STATUS),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }

    async fn write_file(
        &self,
        target: &DeploymentTarget,
        remote_path: &str,
        contents: &str,
    ) -> Result<(), SshError> {
        let remote = format!("cat > {}", shell_quote(remote_path));
        let mut cmd = self.command(target, &remote)?;
        cmd.stdin(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(contents.as_bytes()).await?;
            // Dropping stdin sends EOF so `cat` exits
            drop(stdin);
        }
        let timeout = self.connect_timeout * 3;
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| SshError::Timeout(timeout))??;

        if output.status.success() {
            debug!(server = %target.server_name(), path = %remote_path, bytes = contents.len(), "Uploaded file");
            return Ok(());
        }
        let host = target
            .address()
            .map(|a| a.to_string())
            .unwrap_or_else(|| target.server_name().to_string());
        Err(classify_failure(
            &host,
            output.status.code().unwrap_or(SSH_ERROR_STATUS),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

/// The interactive `ssh` command an operator would type for this target
pub fn manual_ssh_command(target: &DeploymentTarget, remote: Option<&str>) -> String {
    let mut parts = vec!["ssh".to_string()];
    if let Some(identity) = target.identity_file() {
        parts.push("-i".to_string());
        parts.push(identity.display().to_string());
    }
    parts.push(format!(
        "{}@{}",
        target.login_user(),
        crate::probe::address_or_placeholder(target)
    ));
    if let Some(remote) = remote {
        parts.push(shell_quote(remote));
    }
    parts.join(" ")
}

/// Single-quote a string for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-=:@".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
