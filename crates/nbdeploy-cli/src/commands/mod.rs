//! CLI commands

use std::fmt::Display;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use nbdeploy_common::duration::format_duration;
use nbdeploy_common::{DeployConfig, ReadinessConfig, StagePolicyConfig};
use nbdeploy_readiness::{
    stage, Escalator, OperatorPrompt, Orchestrator, OrchestratorResult, PollProgress,
    AbortReason, ProgressSink, RetryPolicy, RunOutcome, StageReport,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{Error, Result};

pub mod deploy;
pub mod destroy;
pub mod render;
pub mod wait;

/// Default deploy file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "nbdeploy.yaml";

/// Extension trait to convert errors with Display to CLI Error::CommandFailed.
pub trait CommandErrorExt<T> {
    /// Convert an error to `Error::CommandFailed` using its Display implementation.
    fn cmd_err(self) -> Result<T>;
}

impl<T, E: Display> CommandErrorExt<T> for std::result::Result<T, E> {
    fn cmd_err(self) -> Result<T> {
        self.map_err(|e| Error::command_failed(e.to_string()))
    }
}

/// Load and validate the deploy file
pub fn load_config(path: &Path) -> Result<DeployConfig> {
    if !path.exists() {
        return Err(Error::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    Ok(DeployConfig::load(path)?)
}

/// Read the IdP client secret from the variable the deploy file names
pub fn idp_client_secret(config: &DeployConfig) -> Result<String> {
    let var = &config.stack.idp.client_secret_env;
    match std::env::var(var) {
        Ok(secret) if !secret.trim().is_empty() => Ok(secret),
        _ => Err(Error::validation(format!(
            "IdP client secret not set; export {} before deploying",
            var
        ))),
    }
}

/// Whether escalation may ask the operator
pub fn is_interactive(non_interactive: bool) -> bool {
    !non_interactive && std::io::stdin().is_terminal()
}

/// Escalator matching the session's interactivity
pub fn escalator(interactive: bool) -> Escalator {
    if interactive {
        Escalator::interactive(Arc::new(StdinPrompt))
    } else {
        Escalator::non_interactive()
    }
}

/// Token cancelled on the first Ctrl-C
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current attempt");
            child.cancel();
        }
    });
    token
}

/// Asks yes/no questions on the terminal
pub struct StdinPrompt;

#[async_trait]
impl OperatorPrompt for StdinPrompt {
    async fn confirm(&self, question: &str) -> bool {
        let mut stdout = tokio::io::stdout();
        let prompt = format!("\n{}\nContinue anyway? [y/N] ", question);
        if stdout.write_all(prompt.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            return false;
        }

        let mut input = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        match reader.read_line(&mut input).await {
            Ok(_) => is_yes(&input),
            Err(_) => false,
        }
    }
}

fn is_yes(answer: &str) -> bool {
    let answer = answer.trim();
    answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes")
}

/// Prints one line per probe attempt and per finished stage
pub struct ConsoleProgress;

impl ConsoleProgress {
    fn attempt_line(progress: &PollProgress<'_>) -> String {
        let mark = if progress.result.is_ready() { "ok" } else { ".." };
        format!("  {} {}", mark, progress)
    }

    fn stage_line(report: &StageReport) -> String {
        format!("==> {}", report)
    }
}

impl ProgressSink for ConsoleProgress {
    fn on_attempt(&self, progress: &PollProgress<'_>) {
        println!("{}", Self::attempt_line(progress));
    }

    fn on_stage_finished(&self, report: &StageReport) {
        println!("{}", Self::stage_line(report));
    }
}

/// Retry policies for every stage, with deploy-file overrides applied
#[derive(Debug, Clone)]
pub struct StagePolicies {
    pub server_boot: RetryPolicy,
    pub ssh_ready: RetryPolicy,
    pub services: RetryPolicy,
    pub tls_cert: RetryPolicy,
}

impl StagePolicies {
    pub fn from_config(readiness: &ReadinessConfig) -> Result<Self> {
        let apply = |name: &str, base: RetryPolicy, overrides: &StagePolicyConfig| {
            base.with_overrides(overrides)
                .map_err(|e| nbdeploy_readiness::Error::policy(name, e))
        };
        Ok(Self {
            server_boot: apply(stage::SERVER_BOOT, RetryPolicy::server_boot(), &readiness.server_boot)?,
            ssh_ready: apply(stage::SSH_READY, RetryPolicy::ssh_ready(), &readiness.ssh_ready)?,
            services: apply(stage::SERVICES, RetryPolicy::services_started(), &readiness.services)?,
            tls_cert: apply(stage::TLS_CERT, RetryPolicy::tls_cert(), &readiness.tls_cert)?,
        })
    }
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            server_boot: RetryPolicy::server_boot(),
            ssh_ready: RetryPolicy::ssh_ready(),
            services: RetryPolicy::services_started(),
            tls_cert: RetryPolicy::tls_cert(),
        }
    }
}

/// Orchestrator wired to the console
pub fn orchestrator(interactive: bool) -> Orchestrator {
    Orchestrator::new(escalator(interactive)).with_progress(Arc::new(ConsoleProgress))
}

/// Summary table printed after a run
pub fn summary(result: &OrchestratorResult) -> String {
    let mut out = String::from("\nSummary:\n");
    for report in &result.stages {
        out.push_str(&format!("  {}\n", report));
    }
    out.push_str(&format!("  total {}\n", format_duration(result.elapsed)));
    out
}

/// Print the run summary and turn an aborted run into an error
pub fn finish(result: &OrchestratorResult) -> Result<()> {
    print!("{}", summary(result));
    match &result.outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Aborted { stage, reason } => {
            match reason {
                AbortReason::TimedOut(diagnostic) => eprintln!("\n{}", diagnostic),
                AbortReason::ActionFailed { message } => {
                    eprintln!("\nstep '{}' failed: {}", stage, message)
                }
                AbortReason::Cancelled => eprintln!("\ncancelled during '{}'", stage),
            }
            Err(Error::aborted(stage.clone()))
        }
    }
}

/// Resolve a deploy file path, treating `~` as the home directory
pub fn config_path(path: &Path) -> PathBuf {
    nbdeploy_common::expand_home(path)
}
