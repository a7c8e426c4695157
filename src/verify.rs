//! Verification controller.
//!
//! Orchestrates the loop: ANALYZING -> SYNTHESIZING -> EXECUTING ->
//! DECIDING -> (ACCEPTED | RETRYING | EXHAUSTED). One session is strictly
//! sequential; each state completes before the next begins. Sessions share
//! nothing, so a host shell may run as many in parallel as it likes.

use crate::config::Config;
use crate::error::SessionError;
use crate::llm::InferenceClient;
use crate::patch::{synthesize, Candidate};
use crate::rules::{count_actionable, Finding, RuleRegistry, Severity, Span, RUNTIME_ERROR_RULE};
use crate::sandbox::{self, ExecutionResult, Limits};
use crate::source::SourceUnit;
use crate::util::CancelToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

/// Why the loop stopped. `Clean` and `Fixed` are the accepting reasons;
/// everything else reports a best-effort failure, not a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// Nothing at or above warning severity; the original source stands.
    Clean,
    /// A candidate ran cleanly and its re-analysis dropped the finding.
    Fixed,
    /// Synthesis produced nothing to try.
    NoCandidate,
    /// Candidates existed but none strictly reduced the finding count.
    NoImprovement,
    /// The retry budget ran out with findings still open.
    AttemptsExhausted,
    /// The shell aborted the session mid-flight.
    Cancelled,
}

impl TerminalReason {
    pub fn is_accepted(&self) -> bool {
        matches!(self, TerminalReason::Clean | TerminalReason::Fixed)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            TerminalReason::Clean => "no findings at or above warning severity",
            TerminalReason::Fixed => "candidate fix verified and accepted",
            TerminalReason::NoCandidate => "no candidate available",
            TerminalReason::NoImprovement => "no candidate improved on the current source",
            TerminalReason::AttemptsExhausted => "retry budget exhausted without a verified fix",
            TerminalReason::Cancelled => "session cancelled",
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// One (candidate, execution) pair, in the order it was tried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub candidate: Candidate,
    pub execution: ExecutionResult,
    /// Actionable findings left when the candidate's source is re-analyzed.
    pub findings_after: usize,
}

/// Terminal state of one session: the sole artifact handed back to the
/// shell for rendering. Partial attempts survive cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub session: Uuid,
    pub accepted: bool,
    pub chosen: Option<Candidate>,
    pub attempts: Vec<Attempt>,
    pub rounds: usize,
    pub terminal: TerminalReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// One analysis session over one snippet.
pub struct Session {
    id: Uuid,
    config: Config,
    registry: RuleRegistry,
    client: Option<InferenceClient>,
    cancel: CancelToken,
}

impl Session {
    pub fn new(config: Config) -> Self {
        Self::with_registry(config, RuleRegistry::with_builtin_rules())
    }

    /// A session with a caller-supplied rule set.
    pub fn with_registry(config: Config, registry: RuleRegistry) -> Self {
        let client = config
            .inference
            .enabled
            .then(|| InferenceClient::new(&config.inference));
        Self {
            id: Uuid::new_v4(),
            config,
            registry,
            client,
            cancel: CancelToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Handle the shell can keep to abort the session from another task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the loop to a terminal state.
    ///
    /// The only error is a fatal host-level failure (cannot spawn the
    /// sandbox child); every per-candidate failure is data in the outcome.
    pub async fn run(&self, source: &str) -> Result<VerificationOutcome, SessionError> {
        let started_at = Utc::now();
        info!(session = %self.id, "verification session started");

        let mut attempts: Vec<Attempt> = Vec::new();
        let mut current = source.to_string();
        let mut prior_error: Option<String> = None;
        let mut rounds = 0usize;
        let max_rounds = self.config.verify.max_attempts.max(1);

        let (terminal, chosen) = loop {
            if self.cancel.is_cancelled() {
                break (TerminalReason::Cancelled, None);
            }
            rounds += 1;

            // ── ANALYZING ────────────────────────────────────────────────
            let unit = SourceUnit::parse(&current);
            let mut findings = self.registry.analyze(&unit);
            let actionable = count_actionable(&findings);
            debug!(
                session = %self.id,
                round = rounds,
                findings = findings.len(),
                actionable,
                "analysis complete"
            );

            if rounds == 1 {
                // Initial validation run: unifies the static and runtime
                // failure channels in one report, and is the only sandbox
                // execution a defect-free snippet ever sees.
                let execution = self.execute(&current, attempts.len()).await?;
                let clean = actionable == 0 && execution.succeeded();
                let cancelled = execution.cancelled;
                prior_error = execution.exception.clone();
                attempts.push(Attempt {
                    candidate: Candidate::original(&current),
                    execution,
                    findings_after: actionable,
                });
                if clean {
                    let chosen = attempts.last().map(|a| a.candidate.clone());
                    break (TerminalReason::Clean, chosen);
                }
                if cancelled {
                    break (TerminalReason::Cancelled, None);
                }
            }

            // Highest-priority unresolved finding: the list is already
            // ordered lowest-location-first with severity breaking ties.
            // A statically clean unit that still raised gets a synthetic
            // runtime finding built from the captured exception.
            findings.retain(|f| f.severity >= Severity::Warning);
            let target = match findings.into_iter().next() {
                Some(finding) => finding,
                None => match prior_error.as_deref() {
                    Some(error) => runtime_finding(error),
                    None => break (TerminalReason::NoCandidate, None),
                },
            };

            // ── SYNTHESIZING ─────────────────────────────────────────────
            let candidates = synthesize(
                &unit,
                &target,
                &self.registry,
                self.client.as_ref(),
                prior_error.as_deref(),
                attempts.len(),
            )
            .await;
            if candidates.is_empty() {
                break (TerminalReason::NoCandidate, None);
            }

            // ── EXECUTING + DECIDING ─────────────────────────────────────
            // Generation order: rule candidates come first because they are
            // cheaper and more trustworthy. First acceptable candidate wins.
            let mut accepted: Option<Candidate> = None;
            let mut best: Option<(usize, usize)> = None;
            for candidate in candidates {
                if self.cancel.is_cancelled() {
                    break;
                }
                let execution = self.execute(&candidate.source, attempts.len()).await?;
                let re_findings = self.registry.analyze(&SourceUnit::parse(&candidate.source));
                let findings_after = count_actionable(&re_findings);
                // Regression guard: accepting a candidate that still
                // carries the originating finding would loop forever.
                let retriggers = re_findings.iter().any(|f| f.rule_id == target.rule_id);
                let ok = execution.succeeded() && !retriggers;
                debug!(
                    session = %self.id,
                    provenance = candidate.provenance.label(),
                    findings_after,
                    accepted = ok,
                    "candidate evaluated"
                );

                attempts.push(Attempt {
                    candidate: candidate.clone(),
                    execution,
                    findings_after,
                });
                let index = attempts.len() - 1;

                if ok {
                    accepted = Some(candidate);
                    break;
                }
                if best.map(|(_, b)| findings_after < b).unwrap_or(true) {
                    best = Some((index, findings_after));
                }
            }

            if let Some(candidate) = accepted {
                break (TerminalReason::Fixed, Some(candidate));
            }
            if self.cancel.is_cancelled() {
                break (TerminalReason::Cancelled, None);
            }

            // ── RETRYING gate ────────────────────────────────────────────
            // Promote the best rejected candidate only while rounds remain
            // and it strictly reduced the finding count (monotonic
            // improvement; anything else oscillates).
            let current_count = actionable.max(1);
            match best {
                Some((index, after)) if rounds < max_rounds && after < current_count => {
                    let promoted = &attempts[index];
                    prior_error = promoted.execution.exception.clone().or_else(|| {
                        promoted.execution.timed_out.then(|| {
                            format!(
                                "execution timed out after {}s",
                                self.config.sandbox.timeout_secs
                            )
                        })
                    });
                    current = promoted.candidate.source.clone();
                    debug!(
                        session = %self.id,
                        round = rounds,
                        remaining = after,
                        "retrying with promoted candidate"
                    );
                }
                Some(_) if rounds >= max_rounds => {
                    break (TerminalReason::AttemptsExhausted, None)
                }
                _ => break (TerminalReason::NoImprovement, None),
            }
        };

        info!(
            session = %self.id,
            terminal = %terminal,
            attempts = attempts.len(),
            "verification session finished"
        );

        Ok(VerificationOutcome {
            session: self.id,
            accepted: terminal.is_accepted(),
            chosen,
            attempts,
            rounds,
            terminal,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Run one candidate in the sandbox without blocking the async runtime.
    async fn execute(&self, source: &str, index: usize) -> Result<ExecutionResult, SessionError> {
        let source = source.to_string();
        let program = self.config.sandbox.python.clone();
        let session = self.id.simple().to_string();
        let label = format!("candidate-{}", index);
        let limits = Limits::from(&self.config.sandbox);
        let cancel = self.cancel.clone();

        let handle = tokio::task::spawn_blocking(move || {
            sandbox::execute(&source, &program, &session, &label, &limits, &cancel)
        });
        match handle.await {
            Ok(result) => result,
            // The blocking task is never aborted, so a join error is a
            // panic in the sandbox; propagate it as such.
            Err(join) => std::panic::resume_unwind(join.into_panic()),
        }
    }
}

/// Build the synthetic finding for an exception the sandbox observed but
/// no static rule could have predicted.
fn runtime_finding(error: &str) -> Finding {
    let message = error
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("execution failed")
        .trim()
        .to_string();
    let line = regex::Regex::new(r"line (\d+)")
        .ok()
        .and_then(|re| re.captures_iter(error).last())
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(1);
    Finding::new(RUNTIME_ERROR_RULE, Severity::Error, Span::point(line, 1), message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Provenance;
    use crate::rules::Rule;

    fn config() -> Config {
        Config::default() // inference disabled
    }

    #[tokio::test]
    async fn test_clean_source_accepted_with_single_validation_run() {
        let source = "def add(a, b):\n    return a + b\n\nprint(add(1, 2))\n";
        let outcome = Session::new(config()).run(source).await.unwrap();

        assert!(outcome.accepted);
        assert_eq!(outcome.terminal, TerminalReason::Clean);
        assert_eq!(outcome.attempts.len(), 1);

        let chosen = outcome.chosen.expect("chosen candidate");
        assert_eq!(chosen.provenance, Provenance::Original);
        assert_eq!(chosen.source, source);
    }

    #[tokio::test]
    async fn test_runtime_error_without_candidates_exhausts() {
        let outcome = Session::new(config()).run("print(1/0)\n").await.unwrap();

        assert!(!outcome.accepted);
        assert_eq!(outcome.terminal, TerminalReason::NoCandidate);
        assert_eq!(outcome.terminal.describe(), "no candidate available");
        assert_eq!(outcome.attempts.len(), 1);

        let exception = outcome.attempts[0]
            .execution
            .exception
            .as_deref()
            .expect("captured exception");
        assert!(exception.contains("ZeroDivisionError"));
    }

    #[tokio::test]
    async fn test_bare_except_fixed_by_rule_candidate() {
        let source = "try:\n    x = 1\nexcept:\n    pass\n";
        let outcome = Session::new(config()).run(source).await.unwrap();

        assert!(outcome.accepted);
        assert_eq!(outcome.terminal, TerminalReason::Fixed);
        assert_eq!(outcome.attempts.len(), 2);

        let chosen = outcome.chosen.expect("chosen candidate");
        assert_eq!(chosen.provenance, Provenance::Rule);
        assert!(chosen.source.contains("except Exception:"));
    }

    #[tokio::test]
    async fn test_syntax_error_with_inference_disabled_exhausts() {
        let outcome = Session::new(config())
            .run("for i in range(10): print(i\n")
            .await
            .unwrap();

        assert!(!outcome.accepted);
        assert_eq!(outcome.terminal, TerminalReason::NoCandidate);
        assert_eq!(outcome.attempts.len(), 1);

        // The raw text still went through the sandbox, so the report
        // carries the interpreter's view of the same failure.
        let exception = outcome.attempts[0]
            .execution
            .exception
            .as_deref()
            .expect("captured exception");
        assert!(exception.contains("SyntaxError"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_preserves_empty_outcome() {
        let session = Session::new(config());
        session.cancel_token().cancel();
        let outcome = session.run("print('hi')\n").await.unwrap();

        assert!(!outcome.accepted);
        assert_eq!(outcome.terminal, TerminalReason::Cancelled);
        assert!(outcome.attempts.is_empty());
    }

    #[tokio::test]
    async fn test_outcome_serializes_for_the_shell() {
        let outcome = Session::new(config()).run("x = 1\n").await.unwrap();
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"terminal\""));
        assert!(json.contains("\"attempts\""));
    }

    // Fixes one marker occurrence per rewrite, so multi-marker sources
    // need the retry path.
    struct MarkerRule;

    impl Rule for MarkerRule {
        fn id(&self) -> &'static str {
            "marker"
        }

        fn check(&self, unit: &SourceUnit) -> anyhow::Result<Vec<Finding>> {
            Ok(unit
                .text
                .lines()
                .enumerate()
                .filter(|(_, line)| line.contains("'marker'"))
                .map(|(i, _)| {
                    Finding::new(
                        "marker",
                        Severity::Warning,
                        Span::point(i + 1, 1),
                        "marker present".to_string(),
                    )
                })
                .collect())
        }

        fn rewrite(&self, unit: &SourceUnit, _finding: &Finding) -> Option<String> {
            Some(unit.text.replacen("'marker'", "'done'", 1))
        }
    }

    // Declares a rewrite that changes nothing, so its findings can never
    // improve.
    struct StuckRule;

    impl Rule for StuckRule {
        fn id(&self) -> &'static str {
            "stuck"
        }

        fn check(&self, unit: &SourceUnit) -> anyhow::Result<Vec<Finding>> {
            Ok(unit
                .text
                .lines()
                .enumerate()
                .filter(|(_, line)| line.contains("'marker'"))
                .map(|(i, _)| {
                    Finding::new(
                        "stuck",
                        Severity::Warning,
                        Span::point(i + 1, 1),
                        "marker present".to_string(),
                    )
                })
                .collect())
        }

        fn rewrite(&self, unit: &SourceUnit, _finding: &Finding) -> Option<String> {
            Some(unit.text.clone())
        }
    }

    #[tokio::test]
    async fn test_retry_path_converges_over_rounds() {
        let mut registry = RuleRegistry::new();
        registry.register(Box::new(MarkerRule));
        let session = Session::with_registry(config(), registry);

        let source = "a = 'marker'\nb = 'marker'\n";
        let outcome = session.run(source).await.unwrap();

        assert!(outcome.accepted);
        assert_eq!(outcome.terminal, TerminalReason::Fixed);
        assert_eq!(outcome.rounds, 2);
        // validation run + one candidate per round
        assert_eq!(outcome.attempts.len(), 3);
        assert!(!outcome.chosen.unwrap().source.contains("'marker'"));
    }

    #[tokio::test]
    async fn test_regression_guard_rejects_unfixed_candidate() {
        let mut registry = RuleRegistry::new();
        registry.register(Box::new(StuckRule));
        let session = Session::with_registry(config(), registry);

        let outcome = session.run("a = 'marker'\n").await.unwrap();

        // The candidate executes cleanly but still re-triggers the finding,
        // and an identical source can never pass the improvement guard.
        assert!(!outcome.accepted);
        assert_eq!(outcome.terminal, TerminalReason::NoImprovement);
        assert_eq!(outcome.rounds, 1);
    }

    #[tokio::test]
    async fn test_attempt_budget_bounds_the_loop() {
        let mut registry = RuleRegistry::new();
        registry.register(Box::new(MarkerRule));
        let mut config = config();
        config.verify.max_attempts = 2;
        let session = Session::with_registry(config, registry);

        let source = "a = 'marker'\nb = 'marker'\nc = 'marker'\n";
        let outcome = session.run(source).await.unwrap();

        assert!(!outcome.accepted);
        assert_eq!(outcome.terminal, TerminalReason::AttemptsExhausted);
        assert_eq!(outcome.rounds, 2);
        // Every rejected attempt is preserved for the report.
        assert_eq!(outcome.attempts.len(), 3);
    }
}
