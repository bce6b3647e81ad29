//! SSH-ready probe
//!
//! Two checks per attempt: a plain TCP connect to the SSH port, which is
//! cheap and tells "closed" apart from "filtered", then a real login that
//! echoes a sentinel. sshd often listens before cloud-init has installed the
//! authorized key, so only the login proves the server is usable.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nbdeploy_common::DeploymentTarget;
use tokio::net::TcpStream;

use crate::probe::{ConditionProbe, ProbeResult};
use crate::remote::{manual_ssh_command, RemoteShell, SshError};

const SENTINEL: &str = "nbdeploy-ready";

/// Ready once an authenticated `echo` over SSH succeeds
pub struct SshReadyProbe {
    shell: Arc<dyn RemoteShell>,
    port: u16,
    connect_timeout: Duration,
    login_timeout: Duration,
}

impl SshReadyProbe {
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            shell,
            port: 22,
            connect_timeout: Duration::from_secs(5),
            login_timeout: Duration::from_secs(15),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    async fn port_open(&self, addr: SocketAddr) -> Result<(), ProbeResult> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => Err(ProbeResult::pending(
                format!("port {} closed (connection refused)", self.port),
            )),
            Ok(Err(e)) => Err(ProbeResult::pending(format!("port {} unreachable: {}", self.port, e))),
            Err(_) => Err(ProbeResult::pending(format!(
                "connection to port {} timed out",
                self.port
            ))),
        }
    }
}

#[async_trait]
impl ConditionProbe for SshReadyProbe {
    async fn check(&self, target: &DeploymentTarget) -> ProbeResult {
        let Some(address) = target.address() else {
            return ProbeResult::permanent(format!(
                "address of {} is not known; the server must be running first",
                target.server_name()
            ));
        };

        if let Err(not_open) = self.port_open(SocketAddr::new(address, self.port)).await {
            return not_open;
        }

        let command = format!("echo {}", SENTINEL);
        match self.shell.exec(target, &command, self.login_timeout).await {
            Ok(out) if out.trim() == SENTINEL => ProbeResult::ready(format!("ssh login as {} ok", target.login_user())),
            Ok(out) => ProbeResult::pending(format!("unexpected ssh output: {}", out.trim())),
            Err(e @ SshError::AuthFailed(_)) => {
                ProbeResult::pending(format!("{} (key may not be installed yet)", e))
            }
            Err(e) if e.is_retryable() => ProbeResult::pending(e.to_string()),
            Err(e) => ProbeResult::permanent(e.to_string()),
        }
    }

    fn manual_command(&self, target: &DeploymentTarget) -> String {
        manual_ssh_command(target, None)
    }
}
