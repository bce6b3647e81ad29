//! Error types for the CLI

use std::path::PathBuf;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Common(#[from] nbdeploy_common::Error),

    #[error(transparent)]
    Readiness(#[from] nbdeploy_readiness::Error),

    #[error("cloud API error: {0}")]
    Cloud(#[from] nbdeploy_hcloud::HcloudError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("deploy file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("server not found: {name}")]
    ServerNotFound { name: String },

    #[error("deployment aborted at stage {stage}")]
    Aborted { stage: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("command failed: {message}")]
    CommandFailed { message: String },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Error::CommandFailed {
            message: message.into(),
        }
    }

    pub fn aborted(stage: impl Into<String>) -> Self {
        Error::Aborted {
            stage: stage.into(),
        }
    }
}
