//! Wire types for the Hetzner Cloud API

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Server lifecycle status as reported by the API
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Initializing,
    Starting,
    Running,
    Stopping,
    Off,
    Deleting,
    Migrating,
    Rebuilding,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Initializing => "initializing",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Off => "off",
            ServerStatus::Deleting => "deleting",
            ServerStatus::Migrating => "migrating",
            ServerStatus::Rebuilding => "rebuilding",
            ServerStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A cloud server
#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub status: ServerStatus,
    pub public_net: PublicNet,
}

impl Server {
    /// Public IPv4 address, once assigned
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.public_net.ipv4.as_ref().map(|v4| v4.ip)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublicNet {
    #[serde(default)]
    pub ipv4: Option<Ipv4Info>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ipv4Info {
    pub ip: Ipv4Addr,
}

/// Request body for `POST /servers`
#[derive(Debug, Clone, Serialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub location: String,
    pub ssh_keys: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub firewalls: Vec<FirewallRef>,
    pub start_after_create: bool,
    pub labels: BTreeMap<String, String>,
}

impl CreateServerRequest {
    pub fn new(name: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("managed-by".to_string(), "nbdeploy".to_string());
        Self {
            name: name.into(),
            server_type: "cx22".to_string(),
            image: "ubuntu-24.04".to_string(),
            location: "nbg1".to_string(),
            ssh_keys: Vec::new(),
            firewalls: Vec::new(),
            start_after_create: true,
            labels,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FirewallRef {
    pub firewall: u64,
}

/// A firewall
#[derive(Debug, Clone, Deserialize)]
pub struct Firewall {
    pub id: u64,
    pub name: String,
}

/// Inbound firewall rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirewallRule {
    pub direction: &'static str,
    pub protocol: &'static str,
    pub port: String,
    pub source_ips: Vec<String>,
    pub description: String,
}

impl FirewallRule {
    fn inbound(protocol: &'static str, port: &str, description: &str) -> Self {
        Self {
            direction: "in",
            protocol,
            port: port.to_string(),
            source_ips: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
            description: description.to_string(),
        }
    }

    /// Ports a NetBird control plane must expose
    pub fn netbird_defaults() -> Vec<Self> {
        vec![
            Self::inbound("tcp", "22", "ssh"),
            Self::inbound("tcp", "80", "http (acme challenge)"),
            Self::inbound("tcp", "443", "https"),
            Self::inbound("udp", "443", "http/3"),
            Self::inbound("udp", "3478", "stun/turn"),
            Self::inbound("udp", "49152-65535", "turn relay range"),
        ]
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateFirewallRequest<'a> {
    pub name: &'a str,
    pub rules: &'a [FirewallRule],
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerEnvelope {
    pub server: Server,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerList {
    pub servers: Vec<Server>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FirewallEnvelope {
    pub firewall: Firewall,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FirewallList {
    pub firewalls: Vec<Firewall>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub code: String,
    pub message: String,
}
