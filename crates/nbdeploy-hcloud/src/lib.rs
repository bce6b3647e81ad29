//! Hetzner Cloud API client
//!
//! Covers the handful of endpoints a deployment needs: servers and
//! firewalls. Everything above this crate talks to the [`CloudProvider`]
//! trait so it can be replaced in tests.

pub mod client;
pub mod error;
pub mod provider;
pub mod types;

pub use client::HcloudClient;
pub use error::{HcloudError, Result};
pub use provider::CloudProvider;
pub use types::{CreateServerRequest, Firewall, FirewallRule, Server, ServerStatus};

#[cfg(test)]
pub use provider::MockCloudProvider;

/// Hetzner Cloud API base URL
pub const DEFAULT_API_URL: &str = "https://api.hetzner.cloud/v1";
