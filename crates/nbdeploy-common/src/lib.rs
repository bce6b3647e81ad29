//! Shared types for nbdeploy
//!
//! Holds the pieces every other crate needs: the error type, the
//! [`DeploymentTarget`] threaded through readiness probes, the deploy file
//! format, duration parsing, configuration templating and logging setup.

pub mod config;
pub mod duration;
pub mod error;
pub mod target;
pub mod telemetry;
pub mod template;

pub use config::{
    expand_home, AzureAdConfig, DeployConfig, ReadinessConfig, ServerSpec, StackConfig,
    StackSecrets, StagePolicyConfig,
};
pub use duration::parse_duration;
pub use error::{Error, Result};
pub use target::DeploymentTarget;

/// Directory on the remote host that holds the rendered NetBird stack
pub const REMOTE_STACK_DIR: &str = "/opt/netbird";

/// Default SSH user for freshly provisioned Hetzner servers
pub const DEFAULT_SSH_USER: &str = "root";
