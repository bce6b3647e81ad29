//! Local deployment state stored at `~/.nbdeploy/`.
//!
//! Secrets generated for a stack (TURN password, relay secret, datastore
//! encryption key) must survive re-runs, otherwise every `deploy` would
//! rotate them and invalidate peers and encrypted data. They are kept per
//! server in `~/.nbdeploy/<server>/secrets.yaml` with owner-only
//! permissions. The IdP client secret is never stored; it always comes
//! from the environment.
//!
//! The state directory resolves as:
//! 1. `NBDEPLOY_STATE_DIR` environment variable
//! 2. `~/.nbdeploy/`

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nbdeploy_common::StackSecrets;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

const STATE_DIR_NAME: &str = ".nbdeploy";
const SECRETS_FILE_NAME: &str = "secrets.yaml";
const STATE_DIR_ENV: &str = "NBDEPLOY_STATE_DIR";

/// Generated secrets as written to disk
#[derive(Clone, Serialize, Deserialize)]
struct StoredSecrets {
    created_at: DateTime<Utc>,
    turn_password: String,
    relay_secret: String,
    datastore_key: String,
}

impl StoredSecrets {
    fn into_stack_secrets(self, idp_client_secret: String) -> StackSecrets {
        StackSecrets {
            idp_client_secret,
            turn_password: self.turn_password,
            relay_secret: self.relay_secret,
            datastore_key: self.datastore_key,
        }
    }
}

/// Per-server secret storage rooted at a state directory
#[derive(Debug, Clone)]
pub struct SecretStore {
    root: PathBuf,
}

impl SecretStore {
    /// Store rooted at `NBDEPLOY_STATE_DIR` or `~/.nbdeploy/`
    pub fn default_location() -> Result<Self> {
        if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
            if !dir.is_empty() {
                return Ok(Self::at(dir));
            }
        }
        let home = dirs::home_dir()
            .ok_or_else(|| Error::command_failed("could not determine home directory"))?;
        Ok(Self::at(home.join(STATE_DIR_NAME)))
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the secrets file for `server`
    pub fn secrets_path(&self, server: &str) -> PathBuf {
        self.root.join(server).join(SECRETS_FILE_NAME)
    }

    /// Load stored secrets for `server`, generating and saving them on first use
    pub fn load_or_generate(&self, server: &str, idp_client_secret: &str) -> Result<StackSecrets> {
        let path = self.secrets_path(server);
        if path.exists() {
            let stored = read_secrets(&path)?;
            debug!(path = %path.display(), created_at = %stored.created_at, "Reusing stored stack secrets");
            return Ok(stored.into_stack_secrets(idp_client_secret.to_string()));
        }

        let secrets = StackSecrets::generate(idp_client_secret);
        write_secrets(
            &path,
            &StoredSecrets {
                created_at: Utc::now(),
                turn_password: secrets.turn_password.clone(),
                relay_secret: secrets.relay_secret.clone(),
                datastore_key: secrets.datastore_key.clone(),
            },
        )?;
        info!(path = %path.display(), "Generated new stack secrets");
        Ok(secrets)
    }

    /// Delete the state kept for `server`. Returns false if there was none.
    pub fn forget(&self, server: &str) -> Result<bool> {
        let dir = self.root.join(server);
        if !dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir).map_err(|e| {
            Error::command_failed(format!("failed to remove {}: {}", dir.display(), e))
        })?;
        Ok(true)
    }
}

fn read_secrets(path: &Path) -> Result<StoredSecrets> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::command_failed(format!("failed to read {}: {}", path.display(), e)))?;
    serde_yaml::from_str(&data)
        .map_err(|e| Error::command_failed(format!("failed to parse {}: {}", path.display(), e)))
}

fn write_secrets(path: &Path, secrets: &StoredSecrets) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::command_failed(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }
    let data = serde_yaml::to_string(secrets)?;
    std::fs::write(path, data)
        .map_err(|e| Error::command_failed(format!("failed to write {}: {}", path.display(), e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_generates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::at(dir.path());

        let secrets = store.load_or_generate("netbird-acme", "idp-secret").unwrap();
        assert_eq!(secrets.idp_client_secret, "idp-secret");
        assert_eq!(secrets.turn_password.len(), 32);
        assert!(store.secrets_path("netbird-acme").exists());
    }

    #[test]
    fn rerun_reuses_generated_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::at(dir.path());

        let first = store.load_or_generate("netbird-acme", "idp-secret").unwrap();
        let second = store.load_or_generate("netbird-acme", "rotated-idp").unwrap();

        assert_eq!(first.turn_password, second.turn_password);
        assert_eq!(first.relay_secret, second.relay_secret);
        assert_eq!(first.datastore_key, second.datastore_key);
        assert_eq!(second.idp_client_secret, "rotated-idp");
    }

    #[test]
    fn idp_secret_is_never_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::at(dir.path());
        store.load_or_generate("netbird-acme", "super-secret-idp").unwrap();

        let raw = std::fs::read_to_string(store.secrets_path("netbird-acme")).unwrap();
        assert!(!raw.contains("super-secret-idp"));
        assert!(raw.contains("created_at"));
    }

    #[test]
    fn servers_do_not_share_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::at(dir.path());

        let a = store.load_or_generate("netbird-a", "idp").unwrap();
        let b = store.load_or_generate("netbird-b", "idp").unwrap();
        assert_ne!(a.relay_secret, b.relay_secret);
    }

    #[cfg(unix)]
    #[test]
    fn secrets_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::at(dir.path());
        store.load_or_generate("netbird-acme", "idp").unwrap();

        let mode = std::fs::metadata(store.secrets_path("netbird-acme"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn forget_removes_server_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::at(dir.path());
        store.load_or_generate("netbird-acme", "idp").unwrap();

        assert!(store.forget("netbird-acme").unwrap());
        assert!(!store.secrets_path("netbird-acme").exists());
        assert!(!store.forget("netbird-acme").unwrap());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::at(dir.path());
        let path = store.secrets_path("netbird-acme");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not: [valid").unwrap();

        let err = store.load_or_generate("netbird-acme", "idp").unwrap_err();
        assert!(err.to_string().contains("failed to parse"), "{}", err);
    }
}
