//! Error types for readiness orchestration

use nbdeploy_hcloud::HcloudError;
use thiserror::Error;

use crate::policy::PolicyError;
use crate::remote::SshError;

/// Result type for deploy actions
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by deploy actions and plan construction
#[derive(Debug, Error)]
pub enum Error {
    /// A stage was configured with an invalid retry policy
    #[error("invalid retry policy for stage {stage}: {source}")]
    Policy {
        stage: String,
        #[source]
        source: PolicyError,
    },

    /// Cloud API call failed
    #[error("cloud API error: {0}")]
    Cloud(#[from] HcloudError),

    /// Remote command over SSH failed
    #[error("remote command failed: {0}")]
    Remote(#[from] SshError),

    /// Shared configuration or target error
    #[error(transparent)]
    Common(#[from] nbdeploy_common::Error),

    /// A deploy action failed for a reason of its own
    #[error("{action} failed: {message}")]
    Action { action: String, message: String },
}

impl Error {
    /// Create a policy error for a named stage
    pub fn policy(stage: impl Into<String>, source: PolicyError) -> Self {
        Self::Policy {
            stage: stage.into(),
            source,
        }
    }

    /// Create an action error
    pub fn action(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Action {
            action: action.into(),
            message: message.into(),
        }
    }

    /// Check if retrying the failed operation could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Cloud(e) => e.is_retryable(),
            Error::Remote(e) => e.is_retryable(),
            Error::Policy { .. } | Error::Common(_) | Error::Action { .. } => false,
        }
    }
}
