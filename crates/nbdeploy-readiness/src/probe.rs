//! Condition probes
//!
//! A probe performs exactly one bounded check of an external resource and
//! reports what it saw. Probes never sleep or retry; that is the poller's
//! job. They also never mutate external state, with one exception: the
//! server probe records the address it discovers on the
//! [`DeploymentTarget`], which is write-once.

use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use nbdeploy_common::DeploymentTarget;

/// Classification of a single probe attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// The condition holds
    Ready,
    /// Not ready yet, worth asking again
    Retryable,
    /// Not ready and will not become ready by waiting
    Permanent,
}

/// Outcome of one probe invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub status: ProbeStatus,
    /// Human-readable diagnostic, e.g. "port 22 closed"
    pub detail: String,
}

impl ProbeResult {
    pub fn ready(detail: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Ready,
            detail: detail.into(),
        }
    }

    /// Not ready yet; the poller should try again
    pub fn pending(detail: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Retryable,
            detail: detail.into(),
        }
    }

    /// Not ready and never will be; the poller should stop immediately
    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Permanent,
            detail: detail.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == ProbeStatus::Ready
    }

    /// Whether a failed attempt is worth retrying. Ready results are not
    /// failures and report `false`.
    pub fn is_retryable(&self) -> bool {
        self.status == ProbeStatus::Retryable
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

/// Single-shot readiness check against one external resource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConditionProbe: Send + Sync {
    /// Check the resource once.
    ///
    /// Must return promptly; the poller additionally bounds each call with
    /// the policy's per-attempt timeout.
    async fn check(&self, target: &DeploymentTarget) -> ProbeResult;

    /// A shell command the operator can run by hand to inspect the same
    /// resource, printed when a stage gives up.
    fn manual_command(&self, target: &DeploymentTarget) -> String;
}

/// Placeholder for an address that is not known yet in manual commands
pub(crate) fn address_or_placeholder(target: &DeploymentTarget) -> String {
    target
        .address()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "<server-ip>".to_string())
}
