//! Cloud provider abstraction

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::types::{CreateServerRequest, Firewall, FirewallRule, Server};
use crate::Result;

/// Server and firewall operations a deployment needs from its cloud
///
/// This trait abstracts the HTTP API for testability.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Describe a server by ID
    async fn get_server(&self, id: u64) -> Result<Server>;

    /// Look up a server by exact name
    async fn find_server(&self, name: &str) -> Result<Option<Server>>;

    /// Create and start a server
    async fn create_server(&self, request: &CreateServerRequest) -> Result<Server>;

    /// Delete a server by ID
    async fn delete_server(&self, id: u64) -> Result<()>;

    /// Return the firewall with this name, creating it with `rules` if absent
    async fn ensure_firewall(&self, name: &str, rules: &[FirewallRule]) -> Result<Firewall>;
}
