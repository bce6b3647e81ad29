//! Rendering of the NetBird stack configuration
//!
//! Text formats (compose file, Caddyfile, coturn config) are minijinja
//! templates compiled into the binary. `management.json` is built as a
//! structured JSON value so secrets never need escaping.

mod context;

use std::path::Path;

use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use serde_json::json;
use tracing::debug;

use crate::config::{StackConfig, StackSecrets};
use crate::{Error, Result};

pub use context::{pkce_scopes, TemplateContext, TURN_MAX_PORT, TURN_MIN_PORT};

/// Compose services the stack runs, in start order
pub const STACK_SERVICES: [&str; 6] = [
    "caddy",
    "dashboard",
    "signal",
    "relay",
    "management",
    "coturn",
];

const TEMPLATES: [(&str, &str); 3] = [
    (
        "docker-compose.yml",
        include_str!("../../templates/docker-compose.yml.j2"),
    ),
    ("Caddyfile", include_str!("../../templates/Caddyfile.j2")),
    (
        "turnserver.conf",
        include_str!("../../templates/turnserver.conf.j2"),
    ),
];

/// PKCE redirect ports the NetBird CLI listens on during login
const PKCE_REDIRECT_PORTS: [u16; 2] = [53000, 54000];

/// One rendered configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub name: String,
    pub contents: String,
}

/// Renders every file of the stack from a typed config
pub struct StackRenderer {
    env: Environment<'static>,
}

impl StackRenderer {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        // Output is YAML and plain config, never HTML
        env.set_auto_escape_callback(|_| AutoEscape::None);

        for (name, source) in TEMPLATES {
            env.add_template(name, source)
                .map_err(|e| Error::template(name, e.to_string()))?;
        }

        Ok(Self { env })
    }

    /// Render all stack files
    pub fn render(&self, stack: &StackConfig, secrets: &StackSecrets) -> Result<Vec<RenderedFile>> {
        stack.validate()?;
        let ctx = TemplateContext::new(stack, secrets);

        let mut files = Vec::with_capacity(TEMPLATES.len() + 1);
        for (name, _) in TEMPLATES {
            let contents = self
                .env
                .get_template(name)
                .and_then(|t| t.render(&ctx))
                .map_err(|e| Error::template(name, e.to_string()))?;
            debug!(file = name, bytes = contents.len(), "Rendered template");
            files.push(RenderedFile {
                name: name.to_string(),
                contents,
            });
        }

        files.push(RenderedFile {
            name: "management.json".to_string(),
            contents: management_json(stack, secrets)?,
        });

        Ok(files)
    }
}

/// Build the NetBird management server config for an Azure AD tenant
pub fn management_json(stack: &StackConfig, secrets: &StackSecrets) -> Result<String> {
    let authority = stack.authority();
    let tenant = &stack.idp.tenant_id;
    let client_id = &stack.idp.client_id;
    let token_endpoint = format!(
        "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
        tenant
    );
    let authorization_endpoint = format!(
        "https://login.microsoftonline.com/{}/oauth2/v2.0/authorize",
        tenant
    );
    let redirect_urls: Vec<String> = PKCE_REDIRECT_PORTS
        .iter()
        .map(|port| format!("http://localhost:{}", port))
        .collect();

    let value = json!({
        "Stuns": [
            { "Proto": "udp", "URI": format!("stun:{}:3478", stack.domain) }
        ],
        "TURNConfig": {
            "Turns": [{
                "Proto": "udp",
                "URI": format!("turn:{}:3478", stack.domain),
                "Username": "self",
                "Password": secrets.turn_password,
            }],
            "CredentialsTTL": "12h",
            "Secret": secrets.turn_password,
            "TimeBasedCredentials": false,
        },
        "Relay": {
            "Addresses": [format!("rels://{}:443/relay", stack.domain)],
            "CredentialsTTL": "24h",
            "Secret": secrets.relay_secret,
        },
        "Signal": {
            "Proto": "https",
            "URI": format!("{}:443", stack.domain),
        },
        "Datadir": "/var/lib/netbird/",
        "DataStoreEncryptionKey": secrets.datastore_key,
        "StoreConfig": { "Engine": "sqlite" },
        "HttpConfig": {
            "Address": "0.0.0.0:80",
            "AuthIssuer": authority,
            "AuthAudience": client_id,
            "AuthKeysLocation": format!(
                "https://login.microsoftonline.com/{}/discovery/v2.0/keys",
                tenant
            ),
            "OIDCConfigEndpoint": format!("{}/.well-known/openid-configuration", authority),
            "IdpSignKeyRefreshEnabled": true,
        },
        "IdpManagerConfig": {
            "ManagerType": "azure",
            "ClientConfig": {
                "Issuer": authority,
                "TokenEndpoint": token_endpoint,
                "ClientID": client_id,
                "ClientSecret": secrets.idp_client_secret,
                "GrantType": "client_credentials",
            },
            "ExtraConfig": {
                "ObjectId": stack.idp.object_id,
                "GraphApiEndpoint": "https://graph.microsoft.com/v1.0",
            },
        },
        "DeviceAuthorizationFlow": {
            "Provider": "none",
        },
        "PKCEAuthorizationFlow": {
            "ProviderConfig": {
                "Audience": client_id,
                "ClientID": client_id,
                "ClientSecret": "",
                "AuthorizationEndpoint": authorization_endpoint,
                "TokenEndpoint": token_endpoint,
                "Scope": pkce_scopes(client_id),
                "RedirectURLs": redirect_urls,
                "UseIDToken": false,
            }
        },
    });

    serde_json::to_string_pretty(&value)
        .map_err(|e| Error::template("management.json", e.to_string()))
}

impl StackSecrets {
    /// Generate fresh stack secrets around an operator-supplied IdP secret
    pub fn generate(idp_client_secret: impl Into<String>) -> Self {
        use base64::Engine;

        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);

        Self {
            idp_client_secret: idp_client_secret.into(),
            turn_password: random_token(32),
            relay_secret: random_token(32),
            datastore_key: base64::engine::general_purpose::STANDARD.encode(key),
        }
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Write rendered files into `dir`, creating it if needed
pub fn write_rendered(dir: &Path, files: &[RenderedFile]) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    for file in files {
        let path = dir.join(&file.name);
        std::fs::write(&path, &file.contents)?;
        debug!(path = %path.display(), "Wrote rendered file");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AzureAdConfig;

    fn stack() -> StackConfig {
        StackConfig {
            domain: "vpn.acme.example".to_string(),
            acme_email: "ops@acme.example".to_string(),
            netbird_version: "0.29.4".to_string(),
            dashboard_version: "v2.5.0".to_string(),
            idp: AzureAdConfig {
                tenant_id: "tenant-123".to_string(),
                client_id: "client-456".to_string(),
                object_id: "object-789".to_string(),
                client_secret_env: "AZURE_CLIENT_SECRET".to_string(),
            },
        }
    }

    fn secrets() -> StackSecrets {
        StackSecrets {
            idp_client_secret: "s3cr\"et".to_string(),
            turn_password: "turnpass".to_string(),
            relay_secret: "relaysecret".to_string(),
            datastore_key: "a2V5".to_string(),
        }
    }

    fn file<'a>(files: &'a [RenderedFile], name: &str) -> &'a str {
        &files
            .iter()
            .find(|f| f.name == name)
            .unwrap_or_else(|| panic!("{} not rendered", name))
            .contents
    }

    // ==========================================================================
    // Story: Rendering a full stack
    // ==========================================================================

    #[test]
    fn renders_all_four_files() {
        let files = StackRenderer::new().unwrap().render(&stack(), &secrets()).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "docker-compose.yml",
                "Caddyfile",
                "turnserver.conf",
                "management.json"
            ]
        );
    }

    #[test]
    fn compose_file_pins_versions_and_declares_every_service() {
        let files = StackRenderer::new().unwrap().render(&stack(), &secrets()).unwrap();
        let compose = file(&files, "docker-compose.yml");

        let parsed: serde_yaml::Value = serde_yaml::from_str(compose).unwrap();
        let services = parsed.get("services").unwrap();
        for service in STACK_SERVICES {
            assert!(services.get(service).is_some(), "missing {}", service);
        }
        assert!(compose.contains("netbirdio/management:0.29.4"));
        assert!(compose.contains("netbirdio/dashboard:v2.5.0"));
        assert!(compose.contains("AUTH_AUTHORITY=https://login.microsoftonline.com/tenant-123/v2.0"));
        assert!(compose.contains("NB_AUTH_SECRET=relaysecret"));
    }

    #[test]
    fn caddyfile_routes_domain_with_acme_email() {
        let files = StackRenderer::new().unwrap().render(&stack(), &secrets()).unwrap();
        let caddy = file(&files, "Caddyfile");
        assert!(caddy.contains("email ops@acme.example"));
        assert!(caddy.contains("vpn.acme.example {"));
        assert!(caddy.contains("reverse_proxy /api/* management:80"));
    }

    #[test]
    fn management_json_escapes_secrets_and_wires_azure() {
        let raw = management_json(&stack(), &secrets()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();

        let idp = &value["IdpManagerConfig"];
        assert_eq!(idp["ManagerType"], "azure");
        assert_eq!(idp["ClientConfig"]["ClientSecret"], "s3cr\"et");
        assert_eq!(idp["ExtraConfig"]["ObjectId"], "object-789");

        let pkce = &value["PKCEAuthorizationFlow"]["ProviderConfig"];
        assert_eq!(pkce["ClientID"], "client-456");
        assert_eq!(
            pkce["Scope"],
            "openid profile email offline_access api://client-456/api"
        );
        assert_eq!(pkce["RedirectURLs"][0], "http://localhost:53000");
        assert_eq!(value["HttpConfig"]["AuthAudience"], "client-456");
    }

    #[test]
    fn invalid_stack_is_rejected_before_rendering() {
        let mut bad = stack();
        bad.domain = "localhost".to_string();
        let err = StackRenderer::new().unwrap().render(&bad, &secrets()).unwrap_err();
        assert_eq!(err.field(), Some("stack.domain"));
    }

    // ==========================================================================
    // Story: Secrets and output
    // ==========================================================================

    #[test]
    fn generated_secrets_are_distinct_and_sized() {
        let a = StackSecrets::generate("idp");
        let b = StackSecrets::generate("idp");
        assert_eq!(a.turn_password.len(), 32);
        assert_ne!(a.turn_password, b.turn_password);
        assert_ne!(a.relay_secret, a.turn_password);
        // 32 bytes base64-encoded
        assert_eq!(a.datastore_key.len(), 44);
    }

    #[test]
    fn secrets_are_not_printed_by_debug() {
        let printed = format!("{:?}", secrets());
        assert!(!printed.contains("turnpass"));
    }

    #[test]
    fn write_rendered_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("stack");
        let files = StackRenderer::new().unwrap().render(&stack(), &secrets()).unwrap();

        write_rendered(&out, &files).unwrap();

        for f in &files {
            let on_disk = std::fs::read_to_string(out.join(&f.name)).unwrap();
            assert_eq!(on_disk, f.contents);
        }
    }
}
