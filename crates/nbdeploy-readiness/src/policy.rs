//! Retry policies for readiness stages
//!
//! One policy per stage: a server boot, an SSH daemon and a certificate
//! issuance all warm up on very different time scales.

use std::time::Duration;

use nbdeploy_common::StagePolicyConfig;
use thiserror::Error;
use tracing::warn;

/// Invalid retry policy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("max_attempts must be greater than zero")]
    ZeroAttempts,

    #[error("total_timeout must be greater than zero")]
    ZeroTimeout,

    #[error("attempt_timeout must be greater than zero")]
    ZeroAttemptTimeout,
}

/// Attempt budget, pacing and time budget for one polling session.
///
/// `total_timeout` is authoritative: the poller stops when it elapses even if
/// attempts remain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    interval: Duration,
    total_timeout: Duration,
    initial_delay: Duration,
    attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Create a validated policy.
    ///
    /// The per-attempt timeout defaults to the interval, floored at one
    /// second; use [`RetryPolicy::with_attempt_timeout`] to change it.
    pub fn new(
        max_attempts: u32,
        interval: Duration,
        total_timeout: Duration,
        initial_delay: Duration,
    ) -> Result<Self, PolicyError> {
        let attempt_timeout = interval.max(Duration::from_secs(1));
        Self::build(max_attempts, interval, total_timeout, initial_delay, attempt_timeout)
    }

    fn build(
        max_attempts: u32,
        interval: Duration,
        total_timeout: Duration,
        initial_delay: Duration,
        attempt_timeout: Duration,
    ) -> Result<Self, PolicyError> {
        if max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        if total_timeout.is_zero() {
            return Err(PolicyError::ZeroTimeout);
        }
        if attempt_timeout.is_zero() {
            return Err(PolicyError::ZeroAttemptTimeout);
        }

        let policy = Self {
            max_attempts,
            interval,
            total_timeout,
            initial_delay,
            attempt_timeout,
        };
        policy.warn_if_unbalanced();
        Ok(policy)
    }

    /// Override the per-attempt probe timeout
    pub fn with_attempt_timeout(self, attempt_timeout: Duration) -> Result<Self, PolicyError> {
        Self::build(
            self.max_attempts,
            self.interval,
            self.total_timeout,
            self.initial_delay,
            attempt_timeout,
        )
    }

    /// Apply deploy-file overrides on top of this policy.
    ///
    /// When only attempts or interval are overridden, the total timeout grows
    /// to keep room for every attempt.
    pub fn with_overrides(self, overrides: &StagePolicyConfig) -> Result<Self, PolicyError> {
        let max_attempts = overrides.max_attempts.unwrap_or(self.max_attempts);
        let interval = overrides.interval.unwrap_or(self.interval);
        let initial_delay = overrides.initial_delay.unwrap_or(self.initial_delay);
        let attempt_timeout = overrides.attempt_timeout.unwrap_or(self.attempt_timeout);
        let total_timeout = match overrides.total_timeout {
            Some(total) => total,
            None => self
                .total_timeout
                .max(budget_for(max_attempts, interval, attempt_timeout)),
        };
        Self::build(max_attempts, interval, total_timeout, initial_delay, attempt_timeout)
    }

    fn warn_if_unbalanced(&self) {
        let planned = self.interval.saturating_mul(self.max_attempts);
        if planned > self.total_timeout.saturating_mul(4) {
            warn!(
                max_attempts = self.max_attempts,
                interval_ms = self.interval.as_millis() as u64,
                total_timeout_ms = self.total_timeout.as_millis() as u64,
                "Retry policy plans far more attempts than its total timeout allows"
            );
        }
    }

    /// Cloud server reaching `running`: 60 x 5s after a 30s head start
    pub fn server_boot() -> Self {
        Self {
            max_attempts: 60,
            interval: Duration::from_secs(5),
            total_timeout: Duration::from_secs(6 * 60),
            initial_delay: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(30),
        }
    }

    /// SSH accepting our key: 60 x 5s, each attempt bounded at 20s
    pub fn ssh_ready() -> Self {
        Self {
            max_attempts: 60,
            interval: Duration::from_secs(5),
            total_timeout: Duration::from_secs(10 * 60),
            initial_delay: Duration::ZERO,
            attempt_timeout: Duration::from_secs(20),
        }
    }

    /// Compose services up after `docker compose up -d`: 40 x 5s
    pub fn services_started() -> Self {
        Self {
            max_attempts: 40,
            interval: Duration::from_secs(5),
            total_timeout: Duration::from_secs(8 * 60),
            initial_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(20),
        }
    }

    /// Certificate issued and served: 30 x 30s, the slowest stage since it
    /// waits on DNS propagation outside our control
    pub fn tls_cert() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(30),
            total_timeout: Duration::from_secs(20 * 60),
            initial_delay: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(20),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn total_timeout(&self) -> Duration {
        self.total_timeout
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }
}

/// Time needed to run every attempt at full per-attempt timeout
fn budget_for(max_attempts: u32, interval: Duration, attempt_timeout: Duration) -> Duration {
    interval
        .saturating_add(attempt_timeout)
        .saturating_mul(max_attempts)
}
