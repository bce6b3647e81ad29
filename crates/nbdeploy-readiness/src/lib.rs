//! Readiness polling for freshly provisioned deployments
//!
//! A deployment is a [`Plan`] of steps run by the [`Orchestrator`]. Wait
//! steps poll [`ConditionProbe`]s under a [`RetryPolicy`] until the resource
//! is ready; timeouts go to the [`Escalator`], which aborts, warns or asks
//! the operator. Action steps change the world once (create the server,
//! upload the stack) and retry only their own transient failures.

pub mod actions;
pub mod backoff;
pub mod error;
pub mod escalation;
pub mod orchestrator;
pub mod policy;
pub mod poller;
pub mod probe;
pub mod probes;
pub mod remote;

pub use error::{Error, Result};
pub use escalation::{ContinueDecision, Diagnostic, EscalationAction, Escalator, OperatorPrompt};
pub use orchestrator::{
    AbortReason, DeployAction, OrchestratorResult, Orchestrator, Plan, RunOutcome, RunState,
    StageDescriptor, StageReport, StageStatus,
};
pub use policy::{PolicyError, RetryPolicy};
pub use poller::{poll, PollOutcome, PollProgress, Poller, ProgressSink};
pub use probe::{ConditionProbe, ProbeResult, ProbeStatus};
pub use remote::{OpenSsh, RemoteShell, SshError};

/// Stage names used in progress output and deploy-file overrides
pub mod stage {
    pub const SERVER_BOOT: &str = "server-boot";
    pub const SSH_READY: &str = "ssh-ready";
    pub const SERVICES: &str = "services";
    pub const TLS_CERT: &str = "tls-cert";
}
