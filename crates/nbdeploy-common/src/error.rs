//! Error types shared across nbdeploy crates
//!
//! Variants carry enough context (file paths, field names) to point the
//! operator at the thing that needs fixing.

use std::path::PathBuf;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Result type for shared operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for configuration, templating and target handling
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid user-supplied value
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "stack.domain")
        field: Option<String>,
    },

    /// Deploy file could not be read or parsed
    #[error("config error in {path}: {message}")]
    Config {
        /// Path of the offending file
        path: PathBuf,
        /// Description of what failed
        message: String,
    },

    /// Template rendering failed
    #[error("template error in {template}: {message}")]
    Template {
        /// Name of the template being rendered
        template: String,
        /// Description of what failed
        message: String,
    },

    /// Address was already recorded for this target
    #[error("address for {server} already recorded as {existing}")]
    AddressAlreadySet {
        /// Server name of the target
        server: String,
        /// The address recorded first
        existing: std::net::IpAddr,
    },

    /// A different cloud server ID was already recorded for this target
    #[error("server id for {server} already recorded as {existing}")]
    ServerIdAlreadySet {
        /// Server name of the target
        server: String,
        /// The ID recorded first
        existing: u64,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error pointing at a specific field
    pub fn validation_for_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a config file error
    pub fn config(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a template error
    pub fn template(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
            message: message.into(),
        }
    }

    /// Get the field path if this is a field validation error
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }
}
