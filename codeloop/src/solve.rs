//! Generate/execute/verify orchestration for a single task.
//!
//! [`Solver`] drives a [`RetrySession`] through its phases, calling the
//! generator, installer and sandbox in order and feeding each recoverable
//! failure back into the next generation request. Only terminal results leave
//! this module; collaborator errors are folded into [`SolveResult`].

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::{remaining_budget, step_timeout};
use crate::core::extract::extract_program;
use crate::core::outcome::classify_outcome;
use crate::core::session::{Phase, RetrySession};
use crate::core::types::{FailureKind, Outcome, SolveResult, TerminalKind};
use crate::io::attempt_log::{AttemptLog, AttemptRecord, RunSummary};
use crate::io::config::SolverConfig;
use crate::io::generator::Generator;
use crate::io::installer::{DependencyFailure, Installer, install_dependencies};
use crate::io::process::Cancelled;
use crate::io::prompt::{PromptBuilder, truncate_tail};
use crate::io::sandbox::Sandbox;

/// Cap on the terminal message handed back to callers.
const MESSAGE_LIMIT_BYTES: usize = 4_000;

const REPEATED_TIMEOUT_HINT: &str = "The program timed out repeatedly. It likely contains an \
infinite loop, waits on input(), or makes a network call without a timeout.";

/// Knobs for one solve, usually derived from [`SolverConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolveOptions {
    pub max_attempts: u32,
    pub exec_timeout: Duration,
    pub solve_timeout: Option<Duration>,
    pub repeated_timeout_threshold: u32,
}

impl SolveOptions {
    pub fn from_config(config: &SolverConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            exec_timeout: config.exec_timeout(),
            solve_timeout: config.solve_timeout(),
            repeated_timeout_threshold: config.repeated_timeout_threshold,
        }
    }
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self::from_config(&SolverConfig::default())
    }
}

/// How a single attempt ended.
enum AttemptEnd {
    Answer(Value),
    Retry,
    Terminal { kind: TerminalKind, message: String },
}

/// Retry controller wiring the loop collaborators together.
pub struct Solver<G, I, S> {
    generator: G,
    installer: I,
    sandbox: S,
    prompts: PromptBuilder,
    options: SolveOptions,
    artifacts: Option<AttemptLog>,
}

impl<G: Generator, I: Installer, S: Sandbox> Solver<G, I, S> {
    pub fn new(
        generator: G,
        installer: I,
        sandbox: S,
        prompts: PromptBuilder,
        options: SolveOptions,
    ) -> Self {
        Self {
            generator,
            installer,
            sandbox,
            prompts,
            options,
            artifacts: None,
        }
    }

    /// Persist prompts, responses, programs and outcomes for every attempt.
    pub fn with_artifacts(mut self, artifacts: AttemptLog) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn options(&self) -> &SolveOptions {
        &self.options
    }

    /// Solve `task`, returning an answer or a terminal failure. Never panics on
    /// collaborator errors.
    #[instrument(skip_all, fields(max_attempts = self.options.max_attempts, task_bytes = task.len()))]
    pub fn solve(&self, task: &str, cancel: &CancellationToken) -> SolveResult {
        let started = Instant::now();
        let started_at = Utc::now().to_rfc3339();
        let deadline = self.options.solve_timeout.map(|budget| started + budget);
        let mut session = RetrySession::new(self.options.max_attempts);

        let result = loop {
            match self.attempt(task, &mut session, deadline, cancel) {
                AttemptEnd::Answer(value) => {
                    info!(attempts = session.attempt(), "task solved");
                    break SolveResult::Answer {
                        value,
                        attempts: session.attempt(),
                    };
                }
                AttemptEnd::Retry => {
                    debug!(attempt = session.attempt(), "retrying with feedback");
                }
                AttemptEnd::Terminal { kind, message } => {
                    warn!(attempts = session.attempt(), kind = kind.as_str(), "solve failed");
                    break SolveResult::Failure {
                        kind,
                        message: truncate_tail(message.trim(), MESSAGE_LIMIT_BYTES),
                        attempts: session.attempt(),
                    };
                }
            }
        };

        if let Some(log) = &self.artifacts {
            let summary = RunSummary {
                run_id: log.run_id(),
                task,
                attempts: result.attempts(),
                started_at,
                duration_ms: started.elapsed().as_millis() as u64,
                result: result.to_caller_json(),
            };
            if let Err(e) = log.write_summary(&summary) {
                warn!(err = %format!("{e:#}"), "failed to write run summary");
            }
        }
        result
    }

    fn attempt(
        &self,
        task: &str,
        session: &mut RetrySession,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> AttemptEnd {
        if cancel.is_cancelled() {
            return cancelled(session);
        }
        if let Some(deadline) = deadline
            && remaining_budget(deadline).is_none()
        {
            return deadline_exceeded(session);
        }

        let attempt = match session.begin_attempt() {
            Ok(attempt) => attempt,
            Err(e) => return internal(session, e),
        };
        info!(attempt, max_attempts = session.max_attempts(), "starting attempt");

        let prompt = match session.feedback() {
            Some(feedback) => self.prompts.regeneration(task, &feedback),
            None => self.prompts.generation(task),
        };
        let prompt = match prompt {
            Ok(prompt) => prompt,
            Err(e) => return internal(session, e),
        };
        self.record(|log| log.write_prompt(attempt, &prompt));

        let response = match self.generator.generate(&prompt, cancel) {
            Ok(response) => response,
            Err(e) if e.is::<Cancelled>() => return cancelled(session),
            Err(e) => {
                warn!(attempt, err = %format!("{e:#}"), "generation failed");
                if let Err(e) = session.on_generation_error() {
                    return internal(session, e);
                }
                return AttemptEnd::Terminal {
                    kind: TerminalKind::Generation,
                    message: format!("generation failed: {e:#}"),
                };
            }
        };
        self.record(|log| log.write_response(attempt, &response));

        let program = extract_program(&response);
        self.record(|log| log.write_program(attempt, &program));
        debug!(
            attempt,
            source_bytes = program.source.len(),
            dependencies = program.dependencies.len(),
            "program extracted"
        );
        match session.on_generated(program.clone()) {
            Ok(Phase::Failed) => {
                warn!(attempt, "model response contained no usable program");
                return AttemptEnd::Terminal {
                    kind: TerminalKind::Generation,
                    message: "no program could be extracted from the model response".to_string(),
                };
            }
            Ok(_) => {}
            Err(e) => return internal(session, e),
        }

        if let Some(diagnostic) = self.sandbox.check_syntax(&program.source) {
            // Execution stays authoritative; the check only surfaces early warnings.
            warn!(attempt, diagnostic = %diagnostic, "program failed syntax check");
        }

        match install_dependencies(&self.installer, &program.dependencies, cancel) {
            Ok(()) => {
                if let Err(e) = session.on_installed() {
                    return internal(session, e);
                }
            }
            Err(e) if e.is::<Cancelled>() => return cancelled(session),
            Err(e) => {
                let Some(failure) = e.downcast_ref::<DependencyFailure>() else {
                    return internal(session, e);
                };
                let diagnostic = failure.to_string();
                let phase = match session.on_install_failed(diagnostic.clone()) {
                    Ok(phase) => phase,
                    Err(e) => return internal(session, e),
                };
                self.record_attempt(
                    attempt,
                    phase,
                    Some(FailureKind::Dependency),
                    Some(diagnostic.as_str()),
                    None,
                );
                return after_failure(session, phase);
            }
        }

        let Some(timeout) = step_timeout(self.options.exec_timeout, deadline) else {
            return deadline_exceeded(session);
        };
        let execution = match self.sandbox.run(&program.source, timeout, cancel) {
            Ok(execution) => execution,
            Err(e) if e.is::<Cancelled>() || cancel.is_cancelled() => return cancelled(session),
            Err(e) => {
                let message = format!("sandbox could not run the program: {e:#}");
                warn!(attempt, err = %message, "sandbox failure");
                session.abort(TerminalKind::Infrastructure, Some(message.clone()));
                return AttemptEnd::Terminal {
                    kind: TerminalKind::Infrastructure,
                    message,
                };
            }
        };
        self.record(|log| log.write_execution(attempt, &execution));
        if let Err(e) = session.on_executed() {
            return internal(session, e);
        }

        let outcome = classify_outcome(&execution);
        let diagnostic = match &outcome {
            Outcome::Timeout => Some(self.timeout_diagnostic(session, timeout)),
            _ => None,
        };
        let phase = match session.on_evaluated(&outcome, diagnostic) {
            Ok(phase) => phase,
            Err(e) => return internal(session, e),
        };
        let last_diagnostic = session.last_failure().map(|failure| failure.diagnostic.clone());
        self.record_attempt(
            attempt,
            phase,
            outcome.failure_kind(),
            last_diagnostic.as_deref().filter(|_| !outcome.is_success()),
            Some(&outcome),
        );

        match outcome {
            Outcome::Success { value } => AttemptEnd::Answer(value),
            _ => {
                if let Some(kind) = outcome.failure_kind() {
                    info!(attempt, kind = kind.as_str(), "attempt failed");
                }
                after_failure(session, phase)
            }
        }
    }

    /// Timeout diagnostic; flags a likely infinite loop once timeouts repeat.
    fn timeout_diagnostic(&self, session: &RetrySession, timeout: Duration) -> String {
        let streak = session.consecutive_timeouts() + 1;
        let mut diagnostic = format!("program timed out after {:.1}s", timeout.as_secs_f64());
        if streak >= self.options.repeated_timeout_threshold {
            diagnostic.push('\n');
            diagnostic.push_str(REPEATED_TIMEOUT_HINT);
        }
        diagnostic
    }

    fn record(&self, write: impl FnOnce(&AttemptLog) -> Result<()>) {
        if let Some(log) = &self.artifacts
            && let Err(e) = write(log)
        {
            warn!(err = %format!("{e:#}"), "failed to write attempt artifact");
        }
    }

    fn record_attempt(
        &self,
        attempt: u32,
        phase: Phase,
        failure: Option<FailureKind>,
        diagnostic: Option<&str>,
        outcome: Option<&Outcome>,
    ) {
        self.record(|log| {
            log.write_record(&AttemptRecord {
                attempt,
                phase,
                failure,
                diagnostic,
                outcome,
            })
        });
    }
}

fn after_failure(session: &RetrySession, phase: Phase) -> AttemptEnd {
    match phase {
        Phase::Generating => AttemptEnd::Retry,
        _ => AttemptEnd::Terminal {
            kind: session
                .terminal_kind()
                .unwrap_or(TerminalKind::Exhausted),
            message: last_diagnostic(session, "attempts exhausted"),
        },
    }
}

fn cancelled(session: &mut RetrySession) -> AttemptEnd {
    session.abort(TerminalKind::Cancelled, None);
    AttemptEnd::Terminal {
        kind: TerminalKind::Cancelled,
        message: "cancelled".to_string(),
    }
}

fn deadline_exceeded(session: &mut RetrySession) -> AttemptEnd {
    let message = match session.last_failure() {
        Some(failure) => format!("solve deadline exceeded; last failure: {}", failure.diagnostic),
        None => "solve deadline exceeded".to_string(),
    };
    session.abort(TerminalKind::Exhausted, None);
    AttemptEnd::Terminal {
        kind: TerminalKind::Exhausted,
        message,
    }
}

fn internal(session: &mut RetrySession, err: anyhow::Error) -> AttemptEnd {
    let message = format!("internal error: {err:#}");
    warn!(err = %message, "solve aborted");
    session.abort(TerminalKind::Infrastructure, None);
    AttemptEnd::Terminal {
        kind: TerminalKind::Infrastructure,
        message,
    }
}

fn last_diagnostic(session: &RetrySession, fallback: &str) -> String {
    session
        .last_failure()
        .map(|failure| failure.diagnostic.clone())
        .unwrap_or_else(|| fallback.to_string())
}

/// Rewrite a raw request into a precise task statement.
///
/// Runs outside the retry session, so it does not count as an attempt. An
/// empty response falls back to the original request.
#[instrument(skip_all, fields(request_bytes = request.len()))]
pub fn refine_task<G: Generator + ?Sized>(
    generator: &G,
    prompts: &PromptBuilder,
    request: &str,
    cancel: &CancellationToken,
) -> Result<String> {
    let prompt = prompts.refinement(request)?;
    let response = generator
        .generate(&prompt, cancel)
        .context("refine task")?;
    let refined = response.trim();
    if refined.is_empty() {
        warn!("refinement returned nothing, using the raw request");
        return Ok(request.trim().to_string());
    }
    debug!(refined_bytes = refined.len(), "task refined");
    Ok(refined.to_string())
}
