//! Finite state machine for one task's generate/install/run/evaluate cycle.
//!
//! The session owns the attempt counter and the feedback carried between
//! attempts. Every transition checks the current phase, so the orchestrator
//! cannot skip or re-enter a step out of order.

use anyhow::{Result, anyhow};
use serde::Serialize;

use crate::core::types::{FailureKind, GeneratedProgram, Outcome, TerminalKind};

/// Phase of a retry session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Generating,
    Installing,
    Running,
    Evaluating,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

/// Recoverable failure recorded for the next generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub kind: FailureKind,
    pub diagnostic: String,
}

/// Previous failing program plus its diagnostic, fed into regeneration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feedback<'a> {
    pub attempt: u32,
    pub program: &'a GeneratedProgram,
    pub failure: &'a AttemptFailure,
}

/// Mutable single-flight state for one task request.
#[derive(Debug, Clone)]
pub struct RetrySession {
    attempt: u32,
    max_attempts: u32,
    phase: Phase,
    last_program: Option<GeneratedProgram>,
    last_failure: Option<AttemptFailure>,
    consecutive_timeouts: u32,
    terminal: Option<TerminalKind>,
}

impl RetrySession {
    /// Start a session in `Generating`. `max_attempts` is clamped to at least 1.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts: max_attempts.max(1),
            phase: Phase::Generating,
            last_program: None,
            last_failure: None,
            consecutive_timeouts: 0,
            terminal: None,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn terminal_kind(&self) -> Option<TerminalKind> {
        self.terminal
    }

    pub fn last_program(&self) -> Option<&GeneratedProgram> {
        self.last_program.as_ref()
    }

    pub fn last_failure(&self) -> Option<&AttemptFailure> {
        self.last_failure.as_ref()
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Feedback for the next generation request, present on every retry.
    pub fn feedback(&self) -> Option<Feedback<'_>> {
        match (&self.last_program, &self.last_failure) {
            (Some(program), Some(failure)) => Some(Feedback {
                attempt: self.attempt,
                program,
                failure,
            }),
            _ => None,
        }
    }

    /// Claim the next attempt number before calling the generator.
    pub fn begin_attempt(&mut self) -> Result<u32> {
        self.expect_phase(Phase::Generating, "begin attempt")?;
        if self.attempt >= self.max_attempts {
            return Err(anyhow!(
                "attempt bound reached ({}/{})",
                self.attempt,
                self.max_attempts
            ));
        }
        self.attempt += 1;
        Ok(self.attempt)
    }

    /// Record the extracted program. Empty programs fail the session outright.
    pub fn on_generated(&mut self, program: GeneratedProgram) -> Result<Phase> {
        self.expect_phase(Phase::Generating, "record generated program")?;
        self.expect_attempt_claimed()?;
        if program.is_empty() {
            return Ok(self.fail(TerminalKind::Generation));
        }
        self.last_program = Some(program);
        self.phase = Phase::Installing;
        Ok(self.phase)
    }

    /// The generator could not be reached or returned an error.
    pub fn on_generation_error(&mut self) -> Result<Phase> {
        self.expect_phase(Phase::Generating, "record generation error")?;
        Ok(self.fail(TerminalKind::Generation))
    }

    pub fn on_installed(&mut self) -> Result<Phase> {
        self.expect_phase(Phase::Installing, "record install success")?;
        self.phase = Phase::Running;
        Ok(self.phase)
    }

    /// Dependency installation failed; regenerate if attempts remain.
    pub fn on_install_failed(&mut self, diagnostic: String) -> Result<Phase> {
        self.expect_phase(Phase::Installing, "record install failure")?;
        self.consecutive_timeouts = 0;
        Ok(self.record_recoverable(FailureKind::Dependency, diagnostic))
    }

    pub fn on_executed(&mut self) -> Result<Phase> {
        self.expect_phase(Phase::Running, "record execution")?;
        self.phase = Phase::Evaluating;
        Ok(self.phase)
    }

    /// Apply the classified outcome of the current attempt.
    ///
    /// `diagnostic` overrides the outcome's own diagnostic text when provided.
    pub fn on_evaluated(&mut self, outcome: &Outcome, diagnostic: Option<String>) -> Result<Phase> {
        self.expect_phase(Phase::Evaluating, "record outcome")?;
        let Some(kind) = outcome.failure_kind() else {
            self.phase = Phase::Done;
            return Ok(self.phase);
        };
        if kind == FailureKind::Timeout {
            self.consecutive_timeouts += 1;
        } else {
            self.consecutive_timeouts = 0;
        }
        let diagnostic = diagnostic.unwrap_or_else(|| outcome.diagnostic());
        Ok(self.record_recoverable(kind, diagnostic))
    }

    /// End the session early (cancellation, exhausted deadline, sandbox failure).
    pub fn abort(&mut self, kind: TerminalKind, diagnostic: Option<String>) -> Phase {
        if let Some(diagnostic) = diagnostic {
            let failure_kind = self
                .last_failure
                .as_ref()
                .map(|failure| failure.kind)
                .unwrap_or(FailureKind::RuntimeFailure);
            self.last_failure = Some(AttemptFailure {
                kind: failure_kind,
                diagnostic,
            });
        }
        self.fail(kind)
    }

    fn record_recoverable(&mut self, kind: FailureKind, diagnostic: String) -> Phase {
        self.last_failure = Some(AttemptFailure { kind, diagnostic });
        if self.attempt < self.max_attempts {
            self.phase = Phase::Generating;
            self.phase
        } else {
            self.fail(TerminalKind::Exhausted)
        }
    }

    fn fail(&mut self, kind: TerminalKind) -> Phase {
        self.phase = Phase::Failed;
        self.terminal = Some(kind);
        self.phase
    }

    fn expect_phase(&self, expected: Phase, action: &str) -> Result<()> {
        if self.phase != expected {
            return Err(anyhow!(
                "cannot {action} in phase {:?} (expected {:?})",
                self.phase,
                expected
            ));
        }
        Ok(())
    }

    fn expect_attempt_claimed(&self) -> Result<()> {
        if self.attempt == 0 {
            return Err(anyhow!("no attempt has been started"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn program(source: &str) -> GeneratedProgram {
        GeneratedProgram::new(source, Vec::new())
    }

    fn run_to_evaluation(session: &mut RetrySession, source: &str) {
        session.begin_attempt().expect("begin");
        assert_eq!(
            session.on_generated(program(source)).expect("generated"),
            Phase::Installing
        );
        assert_eq!(session.on_installed().expect("installed"), Phase::Running);
        assert_eq!(session.on_executed().expect("executed"), Phase::Evaluating);
    }

    #[test]
    fn success_on_first_attempt_is_done() {
        let mut session = RetrySession::new(3);
        run_to_evaluation(&mut session, "answer = 4");
        let phase = session
            .on_evaluated(&Outcome::Success { value: json!(4) }, None)
            .expect("evaluate");
        assert_eq!(phase, Phase::Done);
        assert_eq!(session.attempt(), 1);
        assert!(session.feedback().is_none());
    }

    #[test]
    fn recoverable_failure_carries_feedback_into_next_attempt() {
        let mut session = RetrySession::new(3);
        run_to_evaluation(&mut session, "1/0");
        let outcome = Outcome::RuntimeFailure {
            diagnostic: "ZeroDivisionError".to_string(),
        };
        assert_eq!(
            session.on_evaluated(&outcome, None).expect("evaluate"),
            Phase::Generating
        );

        let feedback = session.feedback().expect("feedback");
        assert_eq!(feedback.program.source, "1/0");
        assert_eq!(feedback.failure.kind, FailureKind::RuntimeFailure);
        assert_eq!(feedback.failure.diagnostic, "ZeroDivisionError");

        assert_eq!(session.begin_attempt().expect("begin"), 2);
    }

    #[test]
    fn exhaustion_fails_after_max_attempts() {
        let mut session = RetrySession::new(2);
        for _ in 0..2 {
            run_to_evaluation(&mut session, "while True: pass");
            session
                .on_evaluated(&Outcome::Timeout, None)
                .expect("evaluate");
        }
        assert_eq!(session.phase(), Phase::Failed);
        assert_eq!(session.terminal_kind(), Some(TerminalKind::Exhausted));
        assert_eq!(session.attempt(), 2);
        assert_eq!(session.consecutive_timeouts(), 2);
        assert!(session.begin_attempt().is_err());
    }

    #[test]
    fn empty_program_fails_without_retry() {
        let mut session = RetrySession::new(5);
        session.begin_attempt().expect("begin");
        let phase = session
            .on_generated(GeneratedProgram::default())
            .expect("generated");
        assert_eq!(phase, Phase::Failed);
        assert_eq!(session.terminal_kind(), Some(TerminalKind::Generation));
    }

    #[test]
    fn install_failure_regenerates_until_bound() {
        let mut session = RetrySession::new(2);
        session.begin_attempt().expect("begin");
        session.on_generated(program("import nope")).expect("gen");
        assert_eq!(
            session
                .on_install_failed("no matching distribution".to_string())
                .expect("install failed"),
            Phase::Generating
        );
        assert_eq!(
            session.feedback().expect("feedback").failure.kind,
            FailureKind::Dependency
        );

        session.begin_attempt().expect("begin");
        session.on_generated(program("import nope")).expect("gen");
        assert_eq!(
            session
                .on_install_failed("still missing".to_string())
                .expect("install failed"),
            Phase::Failed
        );
        assert_eq!(session.terminal_kind(), Some(TerminalKind::Exhausted));
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let mut session = RetrySession::new(2);
        assert!(session.on_installed().is_err());
        assert!(session.on_executed().is_err());
        assert!(
            session
                .on_evaluated(&Outcome::Timeout, None)
                .is_err()
        );
        assert!(session.on_generated(program("x")).is_err(), "no attempt claimed");

        session.begin_attempt().expect("begin");
        session.on_generated(program("x")).expect("gen");
        assert!(session.begin_attempt().is_err());
        assert!(session.on_executed().is_err());
    }

    #[test]
    fn timeout_streak_resets_on_other_failures() {
        let mut session = RetrySession::new(4);
        run_to_evaluation(&mut session, "a");
        session.on_evaluated(&Outcome::Timeout, None).expect("eval");
        assert_eq!(session.consecutive_timeouts(), 1);
        run_to_evaluation(&mut session, "b");
        session
            .on_evaluated(
                &Outcome::RuntimeFailure {
                    diagnostic: "x".to_string(),
                },
                None,
            )
            .expect("eval");
        assert_eq!(session.consecutive_timeouts(), 0);
    }

    #[test]
    fn diagnostic_override_is_recorded() {
        let mut session = RetrySession::new(2);
        run_to_evaluation(&mut session, "a");
        session
            .on_evaluated(&Outcome::Timeout, Some("timed out after 5s".to_string()))
            .expect("eval");
        assert_eq!(
            session.last_failure().expect("failure").diagnostic,
            "timed out after 5s"
        );
    }

    #[test]
    fn abort_marks_terminal_kind() {
        let mut session = RetrySession::new(3);
        session.begin_attempt().expect("begin");
        let phase = session.abort(TerminalKind::Cancelled, Some("cancelled".to_string()));
        assert_eq!(phase, Phase::Failed);
        assert_eq!(session.terminal_kind(), Some(TerminalKind::Cancelled));
        assert_eq!(session.last_failure().expect("failure").diagnostic, "cancelled");
    }

    #[test]
    fn zero_max_attempts_is_clamped() {
        let session = RetrySession::new(0);
        assert_eq!(session.max_attempts(), 1);
    }
}
