//! Hetzner Cloud API errors

use thiserror::Error;

/// Result type for cloud API calls
pub type Result<T> = std::result::Result<T, HcloudError>;

/// Errors returned by the cloud API client
#[derive(Debug, Error)]
pub enum HcloudError {
    /// Transport-level failure (DNS, connect, TLS, timeout)
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with an error status
    #[error("api error {status} ({code}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Machine-readable error code (e.g. "rate_limit_exceeded")
        code: String,
        /// Human-readable message from the API
        message: String,
    },

    /// The requested resource does not exist
    #[error("{resource} {id} not found")]
    NotFound {
        /// Resource kind ("server", "firewall")
        resource: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// The API rejected the token
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Response body did not match the expected shape
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl HcloudError {
    /// Check if this error is worth retrying
    ///
    /// Missing resources and rejected credentials never heal on their own.
    /// Rate limits, server errors, conflicts with running actions and
    /// transport errors usually do.
    pub fn is_retryable(&self) -> bool {
        match self {
            HcloudError::Http(_) => true,
            HcloudError::Api { status, code, .. } => {
                *status == 429 || *status >= 500 || code == "locked" || code == "conflict"
            }
            HcloudError::NotFound { .. } => false,
            HcloudError::Unauthorized(_) => false,
            HcloudError::Decode(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, code: &str) -> HcloudError {
        HcloudError::Api {
            status,
            code: code.to_string(),
            message: "msg".to_string(),
        }
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        assert!(api(429, "rate_limit_exceeded").is_retryable());
        assert!(api(503, "unavailable").is_retryable());
        assert!(api(423, "locked").is_retryable());
    }

    #[test]
    fn client_errors_are_permanent() {
        assert!(!api(422, "invalid_input").is_retryable());
        assert!(!api(403, "forbidden").is_retryable());
    }

    #[test]
    fn not_found_and_unauthorized_are_permanent() {
        let not_found = HcloudError::NotFound {
            resource: "server",
            id: "42".to_string(),
        };
        assert!(!not_found.is_retryable());
        assert_eq!(not_found.to_string(), "server 42 not found");
        assert!(!HcloudError::Unauthorized("bad token".to_string()).is_retryable());
    }
}
