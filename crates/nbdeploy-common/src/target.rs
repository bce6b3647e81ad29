//! Deployment target threaded through every readiness probe
//!
//! The target starts with only a server name. Its cloud ID is recorded once the
//! server is created or adopted, and its address exactly once, when the cloud
//! provider reports the server's public IP. Both are read-only from then on. Probes that need the address treat its absence as
//! an ordering violation rather than waiting for it.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::{Error, Result, DEFAULT_SSH_USER};

/// Address and identity context for one deployment
#[derive(Debug)]
pub struct DeploymentTarget {
    server_name: String,
    server_id: OnceLock<u64>,
    address: OnceLock<IpAddr>,
    domain: Option<String>,
    ssh_user: String,
    ssh_identity: Option<PathBuf>,
}

impl DeploymentTarget {
    /// Create a target for a server whose address is not yet known
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            server_id: OnceLock::new(),
            address: OnceLock::new(),
            domain: None,
            ssh_user: DEFAULT_SSH_USER.to_string(),
            ssh_identity: None,
        }
    }

    /// Create a target for an existing host with a known address
    pub fn with_address(server_name: impl Into<String>, address: IpAddr) -> Self {
        let target = Self::new(server_name);
        // Fresh OnceLock, cannot already be set
        let _ = target.address.set(address);
        target
    }

    /// Set the cloud provider's server ID
    pub fn server_id(self, id: u64) -> Self {
        // Builder runs before anything can record an ID
        let _ = self.server_id.set(id);
        self
    }

    /// Set the domain served by the deployment
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Set the SSH login user
    pub fn ssh_user(mut self, user: impl Into<String>) -> Self {
        self.ssh_user = user.into();
        self
    }

    /// Set the SSH identity file
    pub fn ssh_identity(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_identity = Some(path.into());
        self
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn cloud_server_id(&self) -> Option<u64> {
        self.server_id.get().copied()
    }

    /// The server's public address, once recorded
    pub fn address(&self) -> Option<IpAddr> {
        self.address.get().copied()
    }

    pub fn domain_name(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn login_user(&self) -> &str {
        &self.ssh_user
    }

    pub fn identity_file(&self) -> Option<&PathBuf> {
        self.ssh_identity.as_ref()
    }

    /// Record the server's public address.
    ///
    /// Recording the same address twice is a no-op so that re-polling a
    /// running server stays idempotent. A different address is an error.
    pub fn record_address(&self, address: IpAddr) -> Result<()> {
        match self.address.get() {
            Some(existing) if *existing == address => Ok(()),
            Some(existing) => Err(Error::AddressAlreadySet {
                server: self.server_name.clone(),
                existing: *existing,
            }),
            None => {
                // A concurrent writer may have won the race; re-check its value
                if self.address.set(address).is_err() {
                    return self.record_address(address);
                }
                Ok(())
            }
        }
    }

    /// Record the cloud provider's ID for the server.
    ///
    /// Same rules as [`record_address`](Self::record_address): repeating the
    /// ID is fine, a different one is an error.
    pub fn record_server_id(&self, id: u64) -> Result<()> {
        match self.server_id.get() {
            Some(existing) if *existing == id => Ok(()),
            Some(existing) => Err(Error::ServerIdAlreadySet {
                server: self.server_name.clone(),
                existing: *existing,
            }),
            None => {
                if self.server_id.set(id).is_err() {
                    return self.record_server_id(id);
                }
                Ok(())
            }
        }
    }

    /// `user@address` for SSH, if the address is known
    pub fn ssh_destination(&self) -> Option<String> {
        self.address()
            .map(|addr| format!("{}@{}", self.ssh_user, addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10));

    #[test]
    fn new_target_has_no_address() {
        let target = DeploymentTarget::new("netbird-acme");
        assert!(target.address().is_none());
        assert!(target.ssh_destination().is_none());
        assert_eq!(target.login_user(), "root");
    }

    #[test]
    fn address_is_written_once_then_readable() {
        let target = DeploymentTarget::new("netbird-acme");
        target.record_address(ADDR).unwrap();
        assert_eq!(target.address(), Some(ADDR));
        assert_eq!(target.ssh_destination().as_deref(), Some("root@203.0.113.10"));
    }

    #[test]
    fn recording_same_address_again_is_idempotent() {
        let target = DeploymentTarget::with_address("netbird-acme", ADDR);
        assert!(target.record_address(ADDR).is_ok());
    }

    #[test]
    fn recording_different_address_is_rejected() {
        let target = DeploymentTarget::with_address("netbird-acme", ADDR);
        let other = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 11));
        let err = target.record_address(other).unwrap_err();
        assert!(matches!(err, Error::AddressAlreadySet { existing, .. } if existing == ADDR));
        assert_eq!(target.address(), Some(ADDR));
    }

    #[test]
    fn builder_sets_optional_fields() {
        let target = DeploymentTarget::new("netbird-acme")
            .server_id(42)
            .domain("vpn.example.com")
            .ssh_user("admin")
            .ssh_identity("/home/op/.ssh/id_ed25519");
        assert_eq!(target.cloud_server_id(), Some(42));
        assert_eq!(target.domain_name(), Some("vpn.example.com"));
        assert_eq!(target.login_user(), "admin");
        assert!(target.identity_file().is_some());
    }

    #[test]
    fn server_id_is_recorded_once() {
        let target = DeploymentTarget::new("netbird-acme");
        assert!(target.cloud_server_id().is_none());

        target.record_server_id(7).unwrap();
        target.record_server_id(7).unwrap();
        assert_eq!(target.cloud_server_id(), Some(7));

        let err = target.record_server_id(8).unwrap_err();
        assert!(matches!(err, Error::ServerIdAlreadySet { existing: 7, .. }));
        assert_eq!(target.cloud_server_id(), Some(7));
    }
}
