//! Readiness poller
//!
//! Drives a [`ConditionProbe`] under a [`RetryPolicy`] until the condition
//! holds, the probe reports a permanent failure, the budget runs out, or the
//! run is cancelled:
//!
//! 1. Sleep the policy's initial delay once.
//! 2. Probe, bounded by the per-attempt timeout and the remaining budget.
//! 3. Ready: stop. Permanent failure: stop. Otherwise sleep the interval.
//! 4. Give up after `max_attempts` or `total_timeout`, whichever binds first.
//!
//! Sleeps and in-flight probes both race the cancellation token, so a
//! cancelled run returns within one interval at worst.

use std::fmt;
use std::time::Duration;

use nbdeploy_common::duration::format_duration;
use nbdeploy_common::DeploymentTarget;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::StageReport;
use crate::policy::RetryPolicy;
use crate::probe::{ConditionProbe, ProbeResult, ProbeStatus};

/// Terminal result of one polling session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The condition held on attempt `attempts`
    Ready { attempts: u32, detail: String },
    /// Budget exhausted, or the probe reported a permanent failure
    TimedOut { attempts: u32, detail: String },
    /// The run was cancelled before the condition held
    Cancelled { attempts: u32, detail: String },
}

impl PollOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Ready { attempts, .. }
            | PollOutcome::TimedOut { attempts, .. }
            | PollOutcome::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Detail from the last probe attempt
    pub fn detail(&self) -> &str {
        match self {
            PollOutcome::Ready { detail, .. }
            | PollOutcome::TimedOut { detail, .. }
            | PollOutcome::Cancelled { detail, .. } => detail,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }
}

impl fmt::Display for PollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollOutcome::Ready { attempts, detail } => {
                write!(f, "ready after {} attempt(s): {}", attempts, detail)
            }
            PollOutcome::TimedOut { attempts, detail } => {
                write!(f, "gave up after {} attempt(s): {}", attempts, detail)
            }
            PollOutcome::Cancelled { attempts, detail } => {
                write!(f, "cancelled after {} attempt(s): {}", attempts, detail)
            }
        }
    }
}

/// Snapshot passed to a [`ProgressSink`] after every attempt
#[derive(Debug)]
pub struct PollProgress<'a> {
    pub stage: &'a str,
    pub attempt: u32,
    pub max_attempts: u32,
    pub elapsed: Duration,
    pub result: &'a ProbeResult,
}

impl fmt::Display for PollProgress<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] attempt {}/{} ({}): {}",
            self.stage,
            self.attempt,
            self.max_attempts,
            format_duration(self.elapsed),
            self.result.detail
        )
    }
}

/// Receives per-attempt progress for operator visibility
pub trait ProgressSink: Send + Sync {
    fn on_attempt(&self, progress: &PollProgress<'_>);

    /// Called once per stage or action when it finishes
    fn on_stage_finished(&self, _report: &StageReport) {}
}

/// Polls one stage, optionally reporting each attempt
pub struct Poller<'a> {
    stage: &'a str,
    progress: Option<&'a dyn ProgressSink>,
}

impl<'a> Poller<'a> {
    pub fn new(stage: &'a str) -> Self {
        Self {
            stage,
            progress: None,
        }
    }

    pub fn with_progress(mut self, sink: &'a dyn ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Poll until ready, permanently failed, out of budget, or cancelled
    pub async fn poll(
        &self,
        probe: &dyn ConditionProbe,
        policy: &RetryPolicy,
        target: &DeploymentTarget,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        let start = Instant::now();
        let deadline = start + policy.total_timeout();
        let mut attempts = 0u32;
        let mut last_detail = String::from("no attempt made");

        if !policy.initial_delay().is_zero() {
            debug!(
                stage = %self.stage,
                delay_ms = policy.initial_delay().as_millis() as u64,
                "Waiting before first probe"
            );
            let delay = policy.initial_delay().min(policy.total_timeout());
            if !sleep_or_cancel(delay, cancel).await {
                return self.cancelled(attempts, last_detail);
            }
        }

        while attempts < policy.max_attempts() {
            if cancel.is_cancelled() {
                return self.cancelled(attempts, last_detail);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            // The first attempt always runs so a long initial delay can't
            // turn into a zero-attempt timeout.
            if remaining.is_zero() && attempts > 0 {
                break;
            }
            let attempt_budget = if remaining.is_zero() {
                policy.attempt_timeout()
            } else {
                policy.attempt_timeout().min(remaining)
            };

            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.cancelled(attempts, last_detail);
                }
                checked = tokio::time::timeout(attempt_budget, probe.check(target)) => {
                    checked.unwrap_or_else(|_| {
                        ProbeResult::pending(format!(
                            "probe did not answer within {}",
                            format_duration(attempt_budget)
                        ))
                    })
                }
            };

            let elapsed = start.elapsed();
            self.report(attempts, policy.max_attempts(), elapsed, &result);

            match result.status {
                ProbeStatus::Ready => {
                    info!(
                        stage = %self.stage,
                        attempt = attempts,
                        elapsed_ms = elapsed.as_millis() as u64,
                        detail = %result.detail,
                        "Stage ready"
                    );
                    return PollOutcome::Ready {
                        attempts,
                        detail: result.detail,
                    };
                }
                ProbeStatus::Permanent => {
                    warn!(
                        stage = %self.stage,
                        attempt = attempts,
                        detail = %result.detail,
                        "Probe reported a permanent failure, not retrying"
                    );
                    return PollOutcome::TimedOut {
                        attempts,
                        detail: result.detail,
                    };
                }
                ProbeStatus::Retryable => {
                    last_detail = result.detail;
                }
            }

            if attempts >= policy.max_attempts() {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if !sleep_or_cancel(policy.interval().min(remaining), cancel).await {
                return self.cancelled(attempts, last_detail);
            }
        }

        warn!(
            stage = %self.stage,
            attempts = attempts,
            elapsed_ms = start.elapsed().as_millis() as u64,
            detail = %last_detail,
            "Stage not ready within budget"
        );
        PollOutcome::TimedOut {
            attempts,
            detail: last_detail,
        }
    }

    fn report(&self, attempt: u32, max_attempts: u32, elapsed: Duration, result: &ProbeResult) {
        debug!(
            stage = %self.stage,
            attempt = attempt,
            max_attempts = max_attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            detail = %result.detail,
            "Probe attempt"
        );
        if let Some(sink) = self.progress {
            sink.on_attempt(&PollProgress {
                stage: self.stage,
                attempt,
                max_attempts,
                elapsed,
                result,
            });
        }
    }

    fn cancelled(&self, attempts: u32, last_detail: String) -> PollOutcome {
        info!(stage = %self.stage, attempts = attempts, "Polling cancelled");
        PollOutcome::Cancelled {
            attempts,
            detail: format!("cancelled (last: {})", last_detail),
        }
    }
}

/// Poll a probe without progress reporting
pub async fn poll(
    probe: &dyn ConditionProbe,
    policy: &RetryPolicy,
    target: &DeploymentTarget,
    cancel: &CancellationToken,
) -> PollOutcome {
    Poller::new("poll").poll(probe, policy, target, cancel).await
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MockConditionProbe;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn policy(max_attempts: u32, interval_ms: u64, total_ms: u64) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(interval_ms),
            Duration::from_millis(total_ms),
            Duration::ZERO,
        )
        .unwrap()
    }

    fn target() -> DeploymentTarget {
        DeploymentTarget::with_address("netbird-test", "192.0.2.10".parse().unwrap())
    }

    /// Probe that becomes ready on a given attempt
    fn ready_on(attempt: u32, calls: Arc<AtomicU32>) -> MockConditionProbe {
        let mut probe = MockConditionProbe::new();
        probe.expect_check().returning(move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= attempt {
                ProbeResult::ready("listening")
            } else {
                ProbeResult::pending("port closed")
            }
        });
        probe
    }

    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<String>>,
    }

    impl ProgressSink for RecordingSink {
        fn on_attempt(&self, progress: &PollProgress<'_>) {
            self.lines.lock().unwrap().push(progress.to_string());
        }
    }

    // ==========================================================================
    // Story: Success short-circuits polling
    // ==========================================================================

    #[tokio::test]
    async fn ready_on_third_attempt_makes_exactly_three_calls() {
        let calls = Arc::new(AtomicU32::new(0));
        let probe = ready_on(3, calls.clone());
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::from_secs(10), Duration::ZERO)
            .unwrap();

        let outcome = poll(&probe, &policy, &target(), &CancellationToken::new()).await;

        assert_eq!(
            outcome,
            PollOutcome::Ready {
                attempts: 3,
                detail: "listening".to_string()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn ready_on_attempt_k_never_probes_again() {
        for k in 1..=5 {
            let calls = Arc::new(AtomicU32::new(0));
            let probe = ready_on(k, calls.clone());
            let outcome =
                poll(&probe, &policy(10, 0, 10_000), &target(), &CancellationToken::new()).await;
            assert!(outcome.is_ready());
            assert_eq!(outcome.attempts(), k);
            assert_eq!(calls.load(Ordering::SeqCst), k);
        }
    }

    #[tokio::test]
    async fn already_ready_target_is_ready_on_first_attempt_every_time() {
        let mut probe = MockConditionProbe::new();
        probe
            .expect_check()
            .times(2)
            .returning(|_| ProbeResult::ready("certificate valid"));
        let policy = policy(30, 0, 10_000);
        let target = target();

        for _ in 0..2 {
            let outcome = poll(&probe, &policy, &target, &CancellationToken::new()).await;
            assert_eq!(outcome.attempts(), 1);
            assert!(outcome.is_ready());
        }
    }

    // ==========================================================================
    // Story: Permanent failures fail fast
    // ==========================================================================

    #[tokio::test]
    async fn permanent_failure_stops_after_one_attempt() {
        let mut probe = MockConditionProbe::new();
        probe
            .expect_check()
            .times(1)
            .returning(|_| ProbeResult::permanent("resource deleted"));

        let outcome = poll(&probe, &policy(3, 0, 10_000), &target(), &CancellationToken::new()).await;

        assert_eq!(
            outcome,
            PollOutcome::TimedOut {
                attempts: 1,
                detail: "resource deleted".to_string()
            }
        );
    }

    #[tokio::test]
    async fn permanent_failure_ignores_large_attempt_budget() {
        let mut probe = MockConditionProbe::new();
        probe
            .expect_check()
            .times(1)
            .returning(|_| ProbeResult::permanent("host key changed"));

        let outcome =
            poll(&probe, &policy(1000, 5_000, 3_600_000), &target(), &CancellationToken::new()).await;
        assert_eq!(outcome.attempts(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_after_retries_reports_attempts_made() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut probe = MockConditionProbe::new();
        probe.expect_check().returning(move |_| {
            if c.fetch_add(1, Ordering::SeqCst) < 2 {
                ProbeResult::pending("booting")
            } else {
                ProbeResult::permanent("server not found")
            }
        });

        let outcome = poll(&probe, &policy(10, 0, 10_000), &target(), &CancellationToken::new()).await;
        assert_eq!(
            outcome,
            PollOutcome::TimedOut {
                attempts: 3,
                detail: "server not found".to_string()
            }
        );
    }

    // ==========================================================================
    // Story: Budget exhaustion
    // ==========================================================================

    #[tokio::test]
    async fn attempts_exhausted_returns_last_detail() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut probe = MockConditionProbe::new();
        probe.expect_check().times(4).returning(move |_| {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            ProbeResult::pending(format!("still booting ({})", n))
        });

        let outcome = poll(&probe, &policy(4, 0, 10_000), &target(), &CancellationToken::new()).await;
        assert_eq!(
            outcome,
            PollOutcome::TimedOut {
                attempts: 4,
                detail: "still booting (4)".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn total_timeout_binds_before_attempts() {
        let mut probe = MockConditionProbe::new();
        probe
            .expect_check()
            .returning(|_| ProbeResult::pending("connection refused"));
        // 1000 attempts at 1s would take 1000s; the 10s ceiling must win
        let policy = policy(1000, 1_000, 10_000);

        let start = Instant::now();
        let outcome = poll(&probe, &policy, &target(), &CancellationToken::new()).await;
        let elapsed = start.elapsed();

        assert!(matches!(outcome, PollOutcome::TimedOut { .. }));
        assert!(outcome.attempts() <= 11, "made {} attempts", outcome.attempts());
        assert!(elapsed <= policy.total_timeout() + policy.attempt_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_probe_is_bounded_by_attempt_timeout() {
        struct Hangs;

        #[async_trait::async_trait]
        impl ConditionProbe for Hangs {
            async fn check(&self, _target: &DeploymentTarget) -> ProbeResult {
                std::future::pending().await
            }
            fn manual_command(&self, _target: &DeploymentTarget) -> String {
                "true".to_string()
            }
        }

        let policy = RetryPolicy::new(
            100,
            Duration::from_secs(1),
            Duration::from_secs(30),
            Duration::ZERO,
        )
        .unwrap()
        .with_attempt_timeout(Duration::from_secs(20))
        .unwrap();

        let start = Instant::now();
        let outcome = poll(&Hangs, &policy, &target(), &CancellationToken::new()).await;
        let elapsed = start.elapsed();

        assert!(matches!(outcome, PollOutcome::TimedOut { .. }));
        assert!(outcome.detail().contains("did not answer"));
        assert!(elapsed <= policy.total_timeout() + policy.attempt_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn initial_delay_is_waited_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let probe = ready_on(2, calls.clone());
        let policy = RetryPolicy::new(
            5,
            Duration::from_secs(5),
            Duration::from_secs(300),
            Duration::from_secs(30),
        )
        .unwrap();

        let start = Instant::now();
        let outcome = poll(&probe, &policy, &target(), &CancellationToken::new()).await;

        assert!(outcome.is_ready());
        // 30s head start + one 5s interval
        assert_eq!(start.elapsed().as_secs(), 35);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_delay_longer_than_budget_still_probes_once() {
        let mut probe = MockConditionProbe::new();
        probe
            .expect_check()
            .times(1)
            .returning(|_| ProbeResult::pending("booting"));
        let policy = RetryPolicy::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(10),
            Duration::from_secs(60),
        )
        .unwrap();

        let outcome = poll(&probe, &policy, &target(), &CancellationToken::new()).await;
        assert_eq!(outcome.attempts(), 1);
        assert!(matches!(outcome, PollOutcome::TimedOut { .. }));
    }

    // ==========================================================================
    // Story: Cancellation
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_interval_returns_promptly() {
        let mut probe = MockConditionProbe::new();
        probe
            .expect_check()
            .returning(|_| ProbeResult::pending("dns not propagated"));
        let policy = policy(30, 30_000, 900_000);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let outcome = poll(&probe, &policy, &target(), &cancel).await;

        assert!(matches!(outcome, PollOutcome::Cancelled { attempts: 1, .. }));
        assert!(start.elapsed() < policy.interval());
        assert!(outcome.detail().contains("dns not propagated"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_initial_delay_skips_probing() {
        let mut probe = MockConditionProbe::new();
        probe.expect_check().times(0);
        // 30s head start before the first attempt
        let policy = RetryPolicy::server_boot();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = poll(&probe, &policy, &target(), &cancel).await;
        let elapsed = started.elapsed();

        assert!(matches!(outcome, PollOutcome::Cancelled { attempts: 0, .. }));
        assert!(elapsed >= Duration::from_secs(10), "returned early after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(30), "waited out the delay: {:?}", elapsed);
    }

    // ==========================================================================
    // Story: Progress reporting
    // ==========================================================================

    #[tokio::test]
    async fn progress_is_reported_for_every_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let probe = ready_on(3, calls);
        let sink = RecordingSink::default();

        let outcome = Poller::new("ssh-ready")
            .with_progress(&sink)
            .poll(&probe, &policy(5, 0, 10_000), &target(), &CancellationToken::new())
            .await;

        assert!(outcome.is_ready());
        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("[ssh-ready] attempt 1/5"));
        assert!(lines[0].ends_with("port closed"));
        assert!(lines[2].ends_with("listening"));
    }

    #[test]
    fn outcome_display_is_readable() {
        let outcome = PollOutcome::TimedOut {
            attempts: 60,
            detail: "port 22 closed".to_string(),
        };
        assert_eq!(outcome.to_string(), "gave up after 60 attempt(s): port 22 closed");
    }
}
