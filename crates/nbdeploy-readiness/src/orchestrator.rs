//! Provisioning orchestrator
//!
//! Runs a [`Plan`] of steps in order against one [`DeploymentTarget`]. A step
//! either waits for one or more stages to become ready, or runs a deploy
//! action once. Stages inside a single wait step are polled concurrently; the
//! next step starts once all of them are settled, so step order is where data
//! dependencies live (server exists, then its address is known, then SSH).
//! A stage that times out is escalated as soon as it does, and aborting
//! cancels the rest of its group.
//!
//! ```text
//! NotStarted -> Running(step) -> ... -> Completed
//!                             \-> Aborted
//! ```
//!
//! A timed-out stage is handed to the [`Escalator`]; a cancelled run aborts
//! without escalating.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
#[cfg(test)]
use mockall::automock;
use nbdeploy_common::duration::format_duration;
use nbdeploy_common::DeploymentTarget;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::escalation::{ContinueDecision, Diagnostic, EscalationAction, Escalator};
use crate::poller::{PollOutcome, Poller, ProgressSink};
use crate::policy::RetryPolicy;
use crate::probe::ConditionProbe;
use crate::Result;

/// A named wait: probe, retry policy and what to do on timeout
pub struct StageDescriptor {
    name: String,
    probe: Arc<dyn ConditionProbe>,
    policy: RetryPolicy,
    on_timeout: EscalationAction,
}

impl StageDescriptor {
    /// Create a stage that aborts the deployment on timeout
    pub fn new(name: impl Into<String>, probe: impl ConditionProbe + 'static, policy: RetryPolicy) -> Self {
        Self::shared(name, Arc::new(probe), policy)
    }

    /// Create a stage around a probe shared with other stages
    pub fn shared(name: impl Into<String>, probe: Arc<dyn ConditionProbe>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            probe,
            policy,
            on_timeout: EscalationAction::Abort,
        }
    }

    /// Set the escalation policy applied when the stage times out
    pub fn on_timeout(mut self, action: EscalationAction) -> Self {
        self.on_timeout = action;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn escalation(&self) -> EscalationAction {
        self.on_timeout
    }

    pub fn probe(&self) -> &dyn ConditionProbe {
        self.probe.as_ref()
    }
}

impl fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("on_timeout", &self.on_timeout)
            .finish_non_exhaustive()
    }
}

/// A one-shot step that changes the world, e.g. creating the server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeployAction: Send + Sync {
    /// Name used in progress output and reports
    fn name(&self) -> String;

    /// Perform the action. Implementations retry their own transient
    /// failures and should stop promptly when `cancel` fires.
    async fn run(&self, target: &DeploymentTarget, cancel: &CancellationToken) -> Result<()>;
}

/// One step of a plan
pub enum Step {
    /// Poll these stages concurrently and wait for all of them
    Wait(Vec<StageDescriptor>),
    /// Run an action once
    Run(Box<dyn DeployAction>),
}

impl Step {
    fn label(&self) -> String {
        match self {
            Step::Wait(stages) => stages
                .iter()
                .map(|s| s.name())
                .collect::<Vec<_>>()
                .join(" + "),
            Step::Run(action) => action.name(),
        }
    }
}

/// Ordered list of steps
#[derive(Default)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for a single stage
    pub fn wait(mut self, stage: StageDescriptor) -> Self {
        self.steps.push(Step::Wait(vec![stage]));
        self
    }

    /// Wait for independent stages concurrently
    pub fn wait_all(mut self, stages: Vec<StageDescriptor>) -> Self {
        if !stages.is_empty() {
            self.steps.push(Step::Wait(stages));
        }
        self
    }

    /// Run a deploy action
    pub fn run(mut self, action: impl DeployAction + 'static) -> Self {
        self.steps.push(Step::Run(Box::new(action)));
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Labels of every step, in order
    pub fn describe(&self) -> Vec<String> {
        self.steps.iter().map(Step::label).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Orchestrator lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running(String),
    Completed,
    Aborted,
}

/// How a stage or action ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Ready,
    /// Timed out, but escalation let the deployment continue
    Proceeded,
    TimedOut,
    Cancelled,
    /// An action completed
    Done,
    /// An action failed
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Ready => "ready",
            StageStatus::Proceeded => "timed out (continued)",
            StageStatus::TimedOut => "timed out",
            StageStatus::Cancelled => "cancelled",
            StageStatus::Done => "done",
            StageStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-stage result and timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
    /// Probe attempts; zero for actions
    pub attempts: u32,
    pub elapsed: Duration,
    pub detail: String,
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<18} {:<22} {:>8}",
            self.name,
            self.status.to_string(),
            format_duration(self.elapsed)
        )?;
        if self.attempts > 0 {
            write!(f, "  ({} attempt(s))", self.attempts)?;
        }
        Ok(())
    }
}

/// Why a run stopped early
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// A stage timed out and escalation chose to abort
    TimedOut(Diagnostic),
    /// An action returned an error
    ActionFailed { message: String },
    Cancelled,
}

/// Terminal state of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Aborted { stage: String, reason: AbortReason },
}

/// Everything a run produced
#[derive(Debug, Clone)]
pub struct OrchestratorResult {
    pub outcome: RunOutcome,
    /// Reports in the order stages finished, grouped by step
    pub stages: Vec<StageReport>,
    pub elapsed: Duration,
}

impl OrchestratorResult {
    pub fn is_completed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    /// Name of the stage that stopped the run
    pub fn failed_stage(&self) -> Option<&str> {
        match &self.outcome {
            RunOutcome::Completed => None,
            RunOutcome::Aborted { stage, .. } => Some(stage),
        }
    }

    /// Diagnostic for a stage that timed out and aborted the run
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match &self.outcome {
            RunOutcome::Aborted {
                reason: AbortReason::TimedOut(diagnostic),
                ..
            } => Some(diagnostic),
            _ => None,
        }
    }

    pub fn report(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.name == name)
    }
}

/// Sequences a plan's steps and applies escalation
pub struct Orchestrator {
    escalator: Escalator,
    progress: Option<Arc<dyn ProgressSink>>,
    state: RunState,
}

impl Orchestrator {
    pub fn new(escalator: Escalator) -> Self {
        Self {
            escalator,
            progress: None,
            state: RunState::NotStarted,
        }
    }

    /// Report per-attempt progress and per-stage summaries
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Execute every step of `plan` in order
    pub async fn run(
        &mut self,
        plan: Plan,
        target: &DeploymentTarget,
        cancel: &CancellationToken,
    ) -> OrchestratorResult {
        let started = Instant::now();
        let mut reports = Vec::new();
        info!(
            server = %target.server_name(),
            steps = plan.steps.len(),
            "Starting deployment plan"
        );

        for step in &plan.steps {
            let label = step.label();
            self.state = RunState::Running(label.clone());
            info!(step = %label, "Step started");

            let aborted = match step {
                Step::Wait(stages) => self.wait_for(stages, target, cancel, &mut reports).await,
                Step::Run(action) => self.run_action(action.as_ref(), target, cancel, &mut reports).await,
            };

            if let Some((stage, reason)) = aborted {
                self.state = RunState::Aborted;
                let elapsed = started.elapsed();
                error!(
                    stage = %stage,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Deployment aborted"
                );
                return OrchestratorResult {
                    outcome: RunOutcome::Aborted { stage, reason },
                    stages: reports,
                    elapsed,
                };
            }
        }

        self.state = RunState::Completed;
        let elapsed = started.elapsed();
        info!(elapsed_ms = elapsed.as_millis() as u64, "Deployment plan completed");
        OrchestratorResult {
            outcome: RunOutcome::Completed,
            stages: reports,
            elapsed,
        }
    }

    /// Poll a group of stages, escalating each timeout as soon as it happens
    ///
    /// The group runs under a child of `cancel`; an abort decision cancels
    /// the stages still polling. Reports are kept in plan order.
    async fn wait_for(
        &self,
        stages: &[StageDescriptor],
        target: &DeploymentTarget,
        cancel: &CancellationToken,
        reports: &mut Vec<StageReport>,
    ) -> Option<(String, AbortReason)> {
        let progress = self.progress.as_deref();
        let group = cancel.child_token();
        let mut polls: FuturesUnordered<_> = stages
            .iter()
            .map(|stage| {
                let group = &group;
                async move {
                    let started = Instant::now();
                    let mut poller = Poller::new(stage.name());
                    if let Some(sink) = progress {
                        poller = poller.with_progress(sink);
                    }
                    let outcome = poller
                        .poll(stage.probe(), stage.policy(), target, group)
                        .await;
                    (stage, outcome, started.elapsed())
                }
            })
            .collect();

        let first = reports.len();
        let mut abort = None;
        while let Some((stage, outcome, elapsed)) = polls.next().await {
            match &outcome {
                PollOutcome::Ready { .. } => {
                    self.record(reports, stage.name(), StageStatus::Ready, &outcome, elapsed);
                }
                PollOutcome::Cancelled { .. } => {
                    self.record(reports, stage.name(), StageStatus::Cancelled, &outcome, elapsed);
                    // Only the caller's token can cancel a group nobody aborted
                    if abort.is_none() {
                        abort = Some((stage.name().to_string(), AbortReason::Cancelled));
                    }
                }
                PollOutcome::TimedOut { .. } if abort.is_some() => {
                    self.record(reports, stage.name(), StageStatus::TimedOut, &outcome, elapsed);
                }
                PollOutcome::TimedOut { attempts, detail } => {
                    let diagnostic = Diagnostic {
                        stage: stage.name().to_string(),
                        attempts: *attempts,
                        elapsed,
                        detail: detail.clone(),
                        manual_command: stage.probe().manual_command(target),
                    };
                    let decision = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        decision = self.escalator.escalate(stage.escalation(), &diagnostic) => Some(decision),
                    };
                    match decision {
                        Some(ContinueDecision::Proceed) => {
                            self.record(reports, stage.name(), StageStatus::Proceeded, &outcome, elapsed);
                        }
                        Some(ContinueDecision::Abort) => {
                            self.record(reports, stage.name(), StageStatus::TimedOut, &outcome, elapsed);
                            abort = Some((stage.name().to_string(), AbortReason::TimedOut(diagnostic)));
                            group.cancel();
                        }
                        None => {
                            self.record(reports, stage.name(), StageStatus::Cancelled, &outcome, elapsed);
                            abort = Some((stage.name().to_string(), AbortReason::Cancelled));
                            group.cancel();
                        }
                    }
                }
            }
        }

        let plan_order = |report: &StageReport| stages.iter().position(|s| s.name() == report.name);
        reports[first..].sort_by_key(plan_order);
        abort
    }

    async fn run_action(
        &self,
        action: &dyn DeployAction,
        target: &DeploymentTarget,
        cancel: &CancellationToken,
        reports: &mut Vec<StageReport>,
    ) -> Option<(String, AbortReason)> {
        let name = action.name();
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = action.run(target, cancel) => Some(result),
        };
        let elapsed = started.elapsed();

        let (status, detail, abort) = match result {
            Some(Ok(())) => (StageStatus::Done, "ok".to_string(), None),
            Some(Err(e)) => {
                warn!(action = %name, error = %e, "Action failed");
                let message = e.to_string();
                (
                    StageStatus::Failed,
                    message.clone(),
                    Some(AbortReason::ActionFailed { message }),
                )
            }
            None => (
                StageStatus::Cancelled,
                "cancelled".to_string(),
                Some(AbortReason::Cancelled),
            ),
        };
        self.push(
            reports,
            StageReport {
                name: name.clone(),
                status,
                attempts: 0,
                elapsed,
                detail,
            },
        );
        abort.map(|reason| (name, reason))
    }

    fn record(
        &self,
        reports: &mut Vec<StageReport>,
        name: &str,
        status: StageStatus,
        outcome: &PollOutcome,
        elapsed: Duration,
    ) {
        self.push(
            reports,
            StageReport {
                name: name.to_string(),
                status,
                attempts: outcome.attempts(),
                elapsed,
                detail: outcome.detail().to_string(),
            },
        );
    }

    fn push(&self, reports: &mut Vec<StageReport>, report: StageReport) {
        info!(
            stage = %report.name,
            status = %report.status,
            attempts = report.attempts,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Stage finished"
        );
        if let Some(sink) = &self.progress {
            sink.on_stage_finished(&report);
        }
        reports.push(report);
    }
}
