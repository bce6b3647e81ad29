//! Deploy file format
//!
//! A deploy file is a YAML document describing the server to create, the
//! NetBird stack to render onto it, and optional per-stage readiness
//! overrides:
//!
//! ```yaml
//! server:
//!   name: netbird-acme
//!   server_type: cx22
//!   location: nbg1
//!   ssh_keys: [ops]
//! stack:
//!   domain: vpn.acme.example
//!   acme_email: ops@acme.example
//!   idp:
//!     tenant_id: 00000000-0000-0000-0000-000000000000
//!     client_id: 11111111-1111-1111-1111-111111111111
//!     object_id: 22222222-2222-2222-2222-222222222222
//! readiness:
//!   tls_cert:
//!     max_attempts: 40
//!     interval: 30s
//! ```
//!
//! Secrets never live in the deploy file; see [`StackSecrets`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::deserialize_opt_duration;
use crate::{Error, Result};

/// Top-level deploy file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployConfig {
    pub server: ServerSpec,
    pub stack: StackConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
}

/// Cloud server to provision
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSpec {
    pub name: String,
    #[serde(default = "default_server_type")]
    pub server_type: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_location")]
    pub location: String,
    /// Names of SSH keys already registered with the cloud project
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    /// Local private key matching one of `ssh_keys`
    #[serde(default)]
    pub ssh_identity: Option<PathBuf>,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// Name of the firewall to create or reuse
    #[serde(default)]
    pub firewall: Option<String>,
}

fn default_server_type() -> String {
    "cx22".to_string()
}

fn default_image() -> String {
    "ubuntu-24.04".to_string()
}

fn default_location() -> String {
    "nbg1".to_string()
}

fn default_ssh_user() -> String {
    crate::DEFAULT_SSH_USER.to_string()
}

/// NetBird stack rendered onto the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    /// Public domain the dashboard and management API are served on
    pub domain: String,
    /// Contact address for the ACME account
    pub acme_email: String,
    #[serde(default = "default_netbird_version")]
    pub netbird_version: String,
    #[serde(default = "default_dashboard_version")]
    pub dashboard_version: String,
    pub idp: AzureAdConfig,
}

fn default_netbird_version() -> String {
    "latest".to_string()
}

fn default_dashboard_version() -> String {
    "latest".to_string()
}

/// Azure AD application registration used for OAuth/PKCE login
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AzureAdConfig {
    pub tenant_id: String,
    pub client_id: String,
    /// Object ID of the app registration (used for Graph API user sync)
    pub object_id: String,
    /// Environment variable holding the client secret
    #[serde(default = "default_client_secret_env")]
    pub client_secret_env: String,
}

fn default_client_secret_env() -> String {
    "AZURE_CLIENT_SECRET".to_string()
}

/// Secrets injected into rendered configuration at deploy time
#[derive(Clone, Serialize)]
pub struct StackSecrets {
    pub idp_client_secret: String,
    pub turn_password: String,
    pub relay_secret: String,
    pub datastore_key: String,
}

impl std::fmt::Debug for StackSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackSecrets").finish_non_exhaustive()
    }
}

/// Per-stage overrides for readiness polling.
///
/// Unset fields keep the stage's built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagePolicyConfig {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub interval: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub total_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub initial_delay: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub attempt_timeout: Option<Duration>,
}

/// Readiness overrides keyed by stage
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadinessConfig {
    #[serde(default)]
    pub server_boot: StagePolicyConfig,
    #[serde(default)]
    pub ssh_ready: StagePolicyConfig,
    #[serde(default)]
    pub services: StagePolicyConfig,
    #[serde(default)]
    pub tls_cert: StagePolicyConfig,
}

impl DeployConfig {
    /// Load and validate a deploy file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(path, format!("failed to read: {}", e)))?;
        let config = Self::from_yaml(&raw).map_err(|e| match e {
            Error::Yaml(e) => Error::config(path, e.to_string()),
            other => other,
        })?;
        Ok(config)
    }

    /// Parse and validate a deploy file from YAML text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: DeployConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the type system can't
    pub fn validate(&self) -> Result<()> {
        if self.server.name.trim().is_empty() {
            return Err(Error::validation_for_field("server.name", "must not be empty"));
        }
        if !self
            .server
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::validation_for_field(
                "server.name",
                format!(
                    "'{}' may only contain letters, digits and '-'",
                    self.server.name
                ),
            ));
        }
        self.stack.validate()?;

        for (field, stage) in [
            ("readiness.server_boot", &self.readiness.server_boot),
            ("readiness.ssh_ready", &self.readiness.ssh_ready),
            ("readiness.services", &self.readiness.services),
            ("readiness.tls_cert", &self.readiness.tls_cert),
        ] {
            if stage.max_attempts == Some(0) {
                return Err(Error::validation_for_field(
                    format!("{}.max_attempts", field),
                    "must be greater than zero",
                ));
            }
            if stage.total_timeout == Some(Duration::ZERO) {
                return Err(Error::validation_for_field(
                    format!("{}.total_timeout", field),
                    "must be greater than zero",
                ));
            }
        }
        Ok(())
    }
}

impl StackConfig {
    pub fn validate(&self) -> Result<()> {
        let domain = self.domain.trim();
        if domain.is_empty() || !domain.contains('.') {
            return Err(Error::validation_for_field(
                "stack.domain",
                format!("'{}' is not a fully qualified domain", self.domain),
            ));
        }
        if domain.contains("://") || domain.contains('/') {
            return Err(Error::validation_for_field(
                "stack.domain",
                "must be a bare host name without scheme or path",
            ));
        }
        if !self.acme_email.contains('@') {
            return Err(Error::validation_for_field(
                "stack.acme_email",
                format!("'{}' is not an email address", self.acme_email),
            ));
        }
        for (field, value) in [
            ("stack.idp.tenant_id", &self.idp.tenant_id),
            ("stack.idp.client_id", &self.idp.client_id),
            ("stack.idp.object_id", &self.idp.object_id),
        ] {
            if value.trim().is_empty() {
                return Err(Error::validation_for_field(field, "must not be empty"));
            }
        }
        Ok(())
    }

    /// OIDC authority for the Azure AD tenant
    pub fn authority(&self) -> String {
        format!(
            "https://login.microsoftonline.com/{}/v2.0",
            self.idp.tenant_id
        )
    }
}

/// Expand a leading `~/` to the current user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
server:
  name: netbird-acme
  ssh_keys: [ops]
stack:
  domain: vpn.acme.example
  acme_email: ops@acme.example
  idp:
    tenant_id: tenant
    client_id: client
    object_id: object
"#;

    #[test]
    fn minimal_file_gets_defaults() {
        let config = DeployConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.server.server_type, "cx22");
        assert_eq!(config.server.image, "ubuntu-24.04");
        assert_eq!(config.server.location, "nbg1");
        assert_eq!(config.server.ssh_user, "root");
        assert_eq!(config.stack.netbird_version, "latest");
        assert_eq!(config.stack.idp.client_secret_env, "AZURE_CLIENT_SECRET");
        assert!(config.readiness.tls_cert.max_attempts.is_none());
    }

    #[test]
    fn readiness_overrides_parse_durations() {
        let raw = format!(
            "{}readiness:\n  tls_cert:\n    max_attempts: 40\n    interval: 30s\n    total_timeout: 20m\n",
            MINIMAL
        );
        let config = DeployConfig::from_yaml(&raw).unwrap();
        let tls = &config.readiness.tls_cert;
        assert_eq!(tls.max_attempts, Some(40));
        assert_eq!(tls.interval, Some(Duration::from_secs(30)));
        assert_eq!(tls.total_timeout, Some(Duration::from_secs(1200)));
        assert!(tls.initial_delay.is_none());
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let raw = format!("{}readiness:\n  ssh_ready:\n    max_attempts: 0\n", MINIMAL);
        let err = DeployConfig::from_yaml(&raw).unwrap_err();
        assert_eq!(err.field(), Some("readiness.ssh_ready.max_attempts"));
    }

    #[test]
    fn bad_duration_is_a_yaml_error() {
        let raw = format!("{}readiness:\n  ssh_ready:\n    interval: soon\n", MINIMAL);
        assert!(matches!(DeployConfig::from_yaml(&raw), Err(Error::Yaml(_))));
    }

    #[test]
    fn domain_with_scheme_is_rejected() {
        let raw = MINIMAL.replace("vpn.acme.example", "https://vpn.acme.example");
        let err = DeployConfig::from_yaml(&raw).unwrap_err();
        assert_eq!(err.field(), Some("stack.domain"));
    }

    #[test]
    fn server_name_must_be_dns_safe() {
        let raw = MINIMAL.replace("netbird-acme", "netbird_acme");
        let err = DeployConfig::from_yaml(&raw).unwrap_err();
        assert_eq!(err.field(), Some("server.name"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = MINIMAL.replace("ssh_keys: [ops]", "ssh_keys: [ops]\n  colour: blue");
        assert!(DeployConfig::from_yaml(&raw).is_err());
    }

    #[test]
    fn authority_uses_tenant() {
        let config = DeployConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(
            config.stack.authority(),
            "https://login.microsoftonline.com/tenant/v2.0"
        );
    }

    #[test]
    fn expand_home_leaves_absolute_paths_alone() {
        assert_eq!(
            expand_home(Path::new("/etc/ssh/id")),
            PathBuf::from("/etc/ssh/id")
        );
    }

    #[test]
    fn expand_home_replaces_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/.ssh/id")), home.join(".ssh/id"));
        }
    }

    #[test]
    fn load_reports_missing_file_with_path() {
        let err = DeployConfig::load(Path::new("/nonexistent/deploy.yaml")).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("/nonexistent/deploy.yaml"));
    }
}
