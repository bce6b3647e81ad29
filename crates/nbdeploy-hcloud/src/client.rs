//! reqwest-backed Hetzner Cloud client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::HcloudError;
use crate::provider::CloudProvider;
use crate::types::{
    CreateFirewallRequest, CreateServerRequest, ErrorEnvelope, Firewall, FirewallEnvelope,
    FirewallList, FirewallRule, Server, ServerEnvelope, ServerList,
};
use crate::{Result, DEFAULT_API_URL};

/// Per-request timeout for API calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Hetzner Cloud API client
#[derive(Clone)]
pub struct HcloudClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for HcloudClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HcloudClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HcloudClient {
    /// Create a client for the public API
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(token, DEFAULT_API_URL)
    }

    /// Create a client against a custom endpoint
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(HcloudError::Unauthorized("API token is empty".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("nbdeploy/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        resource: &'static str,
        id: &str,
    ) -> Result<T> {
        let response = builder.send().await?;
        let response = check_status(response, resource, id).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| HcloudError::Decode(e.to_string()))
    }
}

/// Turn a non-success response into a typed error
async fn check_status(response: Response, resource: &'static str, id: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(env) => (env.error.code, env.error.message),
        Err(_) => (status.as_str().to_string(), body),
    };

    Err(match status {
        StatusCode::NOT_FOUND => HcloudError::NotFound {
            resource,
            id: id.to_string(),
        },
        StatusCode::UNAUTHORIZED => HcloudError::Unauthorized(message),
        _ => HcloudError::Api {
            status: status.as_u16(),
            code,
            message,
        },
    })
}

#[async_trait]
impl CloudProvider for HcloudClient {
    async fn get_server(&self, id: u64) -> Result<Server> {
        let id_str = id.to_string();
        let env: ServerEnvelope = self
            .send(
                self.request(Method::GET, &format!("/servers/{}", id)),
                "server",
                &id_str,
            )
            .await?;
        debug!(server_id = id, status = %env.server.status, "Fetched server");
        Ok(env.server)
    }

    async fn find_server(&self, name: &str) -> Result<Option<Server>> {
        let list: ServerList = self
            .send(
                self.request(Method::GET, "/servers").query(&[("name", name)]),
                "server",
                name,
            )
            .await?;
        Ok(list.servers.into_iter().find(|s| s.name == name))
    }

    async fn create_server(&self, request: &CreateServerRequest) -> Result<Server> {
        info!(
            server = %request.name,
            server_type = %request.server_type,
            location = %request.location,
            "Creating server"
        );
        let env: ServerEnvelope = self
            .send(
                self.request(Method::POST, "/servers").json(request),
                "server",
                &request.name,
            )
            .await?;
        Ok(env.server)
    }

    async fn delete_server(&self, id: u64) -> Result<()> {
        let response = self
            .request(Method::DELETE, &format!("/servers/{}", id))
            .send()
            .await?;
        check_status(response, "server", &id.to_string()).await?;
        info!(server_id = id, "Deleted server");
        Ok(())
    }

    async fn ensure_firewall(&self, name: &str, rules: &[FirewallRule]) -> Result<Firewall> {
        let list: FirewallList = self
            .send(
                self.request(Method::GET, "/firewalls").query(&[("name", name)]),
                "firewall",
                name,
            )
            .await?;
        if let Some(existing) = list.firewalls.into_iter().find(|f| f.name == name) {
            debug!(firewall = %name, id = existing.id, "Reusing firewall");
            return Ok(existing);
        }

        info!(firewall = %name, rules = rules.len(), "Creating firewall");
        let env: FirewallEnvelope = self
            .send(
                self.request(Method::POST, "/firewalls")
                    .json(&CreateFirewallRequest { name, rules }),
                "firewall",
                name,
            )
            .await?;
        Ok(env.firewall)
    }
}
