//! Server-running probe backed by the cloud API

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use nbdeploy_common::DeploymentTarget;
use nbdeploy_hcloud::{CloudProvider, HcloudError, Server, ServerStatus, DEFAULT_API_URL};
use tracing::debug;

use crate::probe::{ConditionProbe, ProbeResult};

/// Ready once the cloud reports the server `running` with a public IPv4.
///
/// Records the address on the target the first time it is seen. The server
/// is looked up by ID when the target has one, otherwise by name.
pub struct ServerRunningProbe {
    cloud: Arc<dyn CloudProvider>,
}

impl ServerRunningProbe {
    pub fn new(cloud: Arc<dyn CloudProvider>) -> Self {
        Self { cloud }
    }

    async fn describe(&self, target: &DeploymentTarget) -> Result<Server, HcloudError> {
        match target.cloud_server_id() {
            Some(id) => self.cloud.get_server(id).await,
            None => self
                .cloud
                .find_server(target.server_name())
                .await?
                .ok_or_else(|| HcloudError::NotFound {
                    resource: "server",
                    id: target.server_name().to_string(),
                }),
        }
    }
}

#[async_trait]
impl ConditionProbe for ServerRunningProbe {
    async fn check(&self, target: &DeploymentTarget) -> ProbeResult {
        let server = match self.describe(target).await {
            Ok(server) => server,
            Err(e) if e.is_retryable() => return ProbeResult::pending(format!("cloud API: {}", e)),
            Err(e) => return ProbeResult::permanent(e.to_string()),
        };

        debug!(server = %server.name, status = %server.status, "Server status");
        match server.status {
            ServerStatus::Running => {}
            ServerStatus::Initializing | ServerStatus::Starting => {
                return ProbeResult::pending(format!("server is {}", server.status));
            }
            ServerStatus::Deleting => {
                return ProbeResult::permanent(format!("server {} is being deleted", server.name));
            }
            other => return ProbeResult::pending(format!("server is {}", other)),
        }

        let Some(ip) = server.ipv4() else {
            return ProbeResult::pending("server is running but has no public IPv4 yet");
        };
        match target.record_address(IpAddr::V4(ip)) {
            Ok(()) => ProbeResult::ready(format!("server running at {}", ip)),
            Err(e) => ProbeResult::permanent(e.to_string()),
        }
    }

    fn manual_command(&self, target: &DeploymentTarget) -> String {
        let path = match target.cloud_server_id() {
            Some(id) => format!("servers/{}", id),
            None => format!("servers?name={}", target.server_name()),
        };
        format!(
            "curl -s -H \"Authorization: Bearer $HCLOUD_TOKEN\" '{}/{}'",
            DEFAULT_API_URL, path
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use nbdeploy_hcloud::{CreateServerRequest, Firewall, FirewallRule};

    // The hcloud crate's generated mock only exists in its own test build
    mock! {
        pub Cloud {}

        #[async_trait]
        impl CloudProvider for Cloud {
            async fn get_server(&self, id: u64) -> nbdeploy_hcloud::Result<Server>;
            async fn find_server(&self, name: &str) -> nbdeploy_hcloud::Result<Option<Server>>;
            async fn create_server(&self, request: &CreateServerRequest) -> nbdeploy_hcloud::Result<Server>;
            async fn delete_server(&self, id: u64) -> nbdeploy_hcloud::Result<()>;
            async fn ensure_firewall(&self, name: &str, rules: &[FirewallRule]) -> nbdeploy_hcloud::Result<Firewall>;
        }
    }

    fn server(status: &str, ip: Option<&str>) -> Server {
        let public_net = match ip {
            Some(ip) => serde_json::json!({ "ipv4": { "ip": ip } }),
            None => serde_json::json!({ "ipv4": null }),
        };
        serde_json::from_value(serde_json::json!({
            "id": 42,
            "name": "netbird",
            "status": status,
            "public_net": public_net,
        }))
        .unwrap()
    }

    fn probe_returning(result: fn() -> nbdeploy_hcloud::Result<Server>) -> ServerRunningProbe {
        let mut cloud = MockCloud::new();
        cloud.expect_get_server().returning(move |_| result());
        ServerRunningProbe::new(Arc::new(cloud))
    }

    #[tokio::test]
    async fn running_server_records_address() {
        let probe = probe_returning(|| Ok(server("running", Some("203.0.113.7"))));
        let target = DeploymentTarget::new("netbird").server_id(42);

        let result = probe.check(&target).await;

        assert!(result.is_ready());
        assert_eq!(target.address(), Some("203.0.113.7".parse().unwrap()));
    }

    #[tokio::test]
    async fn rechecking_running_server_is_idempotent() {
        let probe = probe_returning(|| Ok(server("running", Some("203.0.113.7"))));
        let target = DeploymentTarget::new("netbird").server_id(42);

        assert!(probe.check(&target).await.is_ready());
        assert!(probe.check(&target).await.is_ready());
    }

    #[tokio::test]
    async fn starting_server_is_pending() {
        let probe = probe_returning(|| Ok(server("initializing", None)));
        let target = DeploymentTarget::new("netbird").server_id(42);

        let result = probe.check(&target).await;
        assert!(result.is_retryable());
        assert_eq!(result.detail, "server is initializing");
        assert_eq!(target.address(), None);
    }

    #[tokio::test]
    async fn running_without_ip_is_pending() {
        let probe = probe_returning(|| Ok(server("running", None)));
        let result = probe.check(&DeploymentTarget::new("netbird").server_id(42)).await;
        assert!(result.is_retryable());
    }

    #[tokio::test]
    async fn rate_limit_is_retryable() {
        let probe = probe_returning(|| {
            Err(HcloudError::Api {
                status: 429,
                code: "rate_limit_exceeded".into(),
                message: "slow down".into(),
            })
        });
        let result = probe.check(&DeploymentTarget::new("netbird").server_id(42)).await;
        assert!(result.is_retryable());
        assert!(result.detail.contains("slow down"));
    }

    #[tokio::test]
    async fn missing_server_is_permanent() {
        let probe = probe_returning(|| {
            Err(HcloudError::NotFound {
                resource: "server",
                id: "42".into(),
            })
        });
        let result = probe.check(&DeploymentTarget::new("netbird").server_id(42)).await;
        assert!(!result.is_retryable());
        assert!(!result.is_ready());
        assert_eq!(result.detail, "server 42 not found");
    }

    #[tokio::test]
    async fn lookup_by_name_when_id_unknown() {
        let mut cloud = MockCloud::new();
        cloud
            .expect_find_server()
            .withf(|name| name.to_string() == "netbird")
            .returning(|_| Ok(Some(server("running", Some("203.0.113.7")))));
        let probe = ServerRunningProbe::new(Arc::new(cloud));

        assert!(probe.check(&DeploymentTarget::new("netbird")).await.is_ready());
    }

    #[tokio::test]
    async fn address_change_is_permanent() {
        let probe = probe_returning(|| Ok(server("running", Some("203.0.113.8"))));
        let target = DeploymentTarget::with_address("netbird", "203.0.113.7".parse().unwrap())
            .server_id(42);

        let result = probe.check(&target).await;
        assert!(!result.is_retryable());
        assert!(!result.is_ready());
    }

    #[test]
    fn manual_command_queries_api() {
        let probe = probe_returning(|| Ok(server("running", None)));
        let cmd = probe.manual_command(&DeploymentTarget::new("netbird").server_id(42));
        assert_eq!(
            cmd,
            "curl -s -H \"Authorization: Bearer $HCLOUD_TOKEN\" 'https://api.hetzner.cloud/v1/servers/42'"
        );
    }
}
