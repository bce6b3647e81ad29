//! Escalation when a stage runs out of budget
//!
//! A stage that times out is not automatically fatal. Its descriptor says
//! whether to abort, warn and carry on, or ask the operator. Asking only
//! happens when someone can answer: non-interactive runs always abort.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use nbdeploy_common::duration::format_duration;
use tracing::{error, info, warn};

/// What to do when a stage times out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EscalationAction {
    /// Stop the deployment
    #[default]
    Abort,
    /// Log the diagnostic and move on; later steps retry on their own
    WarnAndContinue,
    /// Ask the operator, aborting if nobody can answer
    PromptOperator,
}

/// Result of an escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueDecision {
    Abort,
    Proceed,
}

/// Everything an operator needs to pick up a failed stage by hand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub stage: String,
    pub attempts: u32,
    pub elapsed: Duration,
    /// Detail from the last probe attempt
    pub detail: String,
    /// Copy-pasteable command that inspects the same resource
    pub manual_command: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "stage '{}' not ready after {} attempt(s) in {}",
            self.stage,
            self.attempts,
            format_duration(self.elapsed)
        )?;
        writeln!(f, "  last result: {}", self.detail)?;
        write!(f, "  debug by hand: {}", self.manual_command)
    }
}

/// Asks the operator a yes/no question
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Return true if the operator answered yes
    async fn confirm(&self, question: &str) -> bool;
}

/// Applies a stage's timeout policy
#[derive(Clone)]
pub struct Escalator {
    prompt: Option<Arc<dyn OperatorPrompt>>,
}

impl Escalator {
    /// Escalator for unattended runs: prompts degrade to abort
    pub fn non_interactive() -> Self {
        Self { prompt: None }
    }

    /// Escalator that can ask the operator
    pub fn interactive(prompt: Arc<dyn OperatorPrompt>) -> Self {
        Self {
            prompt: Some(prompt),
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.prompt.is_some()
    }

    /// Decide whether the deployment continues past a timed-out stage
    pub async fn escalate(&self, action: EscalationAction, diagnostic: &Diagnostic) -> ContinueDecision {
        match action {
            EscalationAction::Abort => {
                error!(
                    stage = %diagnostic.stage,
                    attempts = diagnostic.attempts,
                    detail = %diagnostic.detail,
                    manual_command = %diagnostic.manual_command,
                    "Stage timed out, aborting deployment"
                );
                ContinueDecision::Abort
            }
            EscalationAction::WarnAndContinue => {
                warn!(
                    stage = %diagnostic.stage,
                    attempts = diagnostic.attempts,
                    detail = %diagnostic.detail,
                    manual_command = %diagnostic.manual_command,
                    "Stage timed out, continuing anyway"
                );
                ContinueDecision::Proceed
            }
            EscalationAction::PromptOperator => match &self.prompt {
                None => {
                    error!(
                        stage = %diagnostic.stage,
                        detail = %diagnostic.detail,
                        manual_command = %diagnostic.manual_command,
                        "Stage timed out and no operator is available to confirm, aborting"
                    );
                    ContinueDecision::Abort
                }
                Some(prompt) => {
                    let question = format!("{}\nContinue anyway?", diagnostic);
                    if prompt.confirm(&question).await {
                        info!(stage = %diagnostic.stage, "Operator chose to continue");
                        ContinueDecision::Proceed
                    } else {
                        info!(stage = %diagnostic.stage, "Operator chose to abort");
                        ContinueDecision::Abort
                    }
                }
            },
        }
    }
}

impl Default for Escalator {
    fn default() -> Self {
        Self::non_interactive()
    }
}
