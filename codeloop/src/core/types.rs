//! Shared deterministic types for the generate/execute/verify loop.
//!
//! These types define the contracts between loop components. They carry no I/O
//! and compare structurally, so tests can build them by hand.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Candidate program recovered from a model response.
///
/// The source is not guaranteed to be valid; running it is the authoritative check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedProgram {
    #[serde(rename = "program")]
    pub source: String,
    pub dependencies: Vec<String>,
}

impl GeneratedProgram {
    pub fn new(source: impl Into<String>, dependencies: Vec<String>) -> Self {
        Self {
            source: source.into(),
            dependencies,
        }
    }

    /// Empty programs signal that extraction failed entirely.
    pub fn is_empty(&self) -> bool {
        self.source.trim().is_empty()
    }
}

/// Captured result of a single sandboxed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Bytes dropped from stdout by the output cap.
    pub stdout_truncated: usize,
    /// Bytes dropped from stderr by the output cap.
    pub stderr_truncated: usize,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Classified result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The program printed a well-formed result block.
    Success { value: Value },
    /// The program ran but did not honor the output protocol.
    ContractViolation {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diagnostic: Option<String>,
    },
    /// Non-zero exit or an explicit error line.
    RuntimeFailure { diagnostic: String },
    /// The wall-clock limit was exceeded and the process was killed.
    Timeout,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Failure category, or `None` for success.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::ContractViolation { .. } => Some(FailureKind::ContractViolation),
            Outcome::RuntimeFailure { .. } => Some(FailureKind::RuntimeFailure),
            Outcome::Timeout => Some(FailureKind::Timeout),
        }
    }

    /// Diagnostic text suitable for feeding back into regeneration.
    pub fn diagnostic(&self) -> String {
        match self {
            Outcome::Success { .. } => String::new(),
            Outcome::ContractViolation {
                reason,
                diagnostic: Some(detail),
            } => format!("contract violation: {reason}\n{detail}"),
            Outcome::ContractViolation {
                reason,
                diagnostic: None,
            } => format!("contract violation: {reason}"),
            Outcome::RuntimeFailure { diagnostic } => diagnostic.clone(),
            Outcome::Timeout => "program timed out".to_string(),
        }
    }
}

/// Recoverable failure categories recorded by a retry session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Dependency,
    ContractViolation,
    RuntimeFailure,
    Timeout,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Dependency => "dependency",
            FailureKind::ContractViolation => "contract_violation",
            FailureKind::RuntimeFailure => "runtime_failure",
            FailureKind::Timeout => "timeout",
        }
    }
}

/// Reason a solve ended without an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    /// No program could be extracted, or the generator itself failed.
    Generation,
    /// Every attempt failed with a recoverable outcome.
    Exhausted,
    /// The caller cancelled the session.
    Cancelled,
    /// The sandbox could not run a program at all.
    Infrastructure,
}

impl TerminalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalKind::Generation => "generation",
            TerminalKind::Exhausted => "exhausted",
            TerminalKind::Cancelled => "cancelled",
            TerminalKind::Infrastructure => "infrastructure",
        }
    }
}

/// Terminal result of a retry session.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveResult {
    Answer {
        value: Value,
        attempts: u32,
    },
    Failure {
        kind: TerminalKind,
        message: String,
        attempts: u32,
    },
}

impl SolveResult {
    pub fn attempts(&self) -> u32 {
        match self {
            SolveResult::Answer { attempts, .. } | SolveResult::Failure { attempts, .. } => {
                *attempts
            }
        }
    }

    /// Caller-facing shape: `{"ok": value}` or `{"error": message, "attempts": n}`.
    pub fn to_caller_json(&self) -> Value {
        match self {
            SolveResult::Answer { value, .. } => serde_json::json!({ "ok": value }),
            SolveResult::Failure {
                message, attempts, ..
            } => serde_json::json!({ "error": message, "attempts": attempts }),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blank_program_is_empty() {
        assert!(GeneratedProgram::new("  \n", vec!["x".into()]).is_empty());
        assert!(!GeneratedProgram::new("print(1)", Vec::new()).is_empty());
    }

    #[test]
    fn caller_json_shapes() {
        let ok = SolveResult::Answer {
            value: json!([1, 2]),
            attempts: 1,
        };
        assert_eq!(ok.to_caller_json(), json!({"ok": [1, 2]}));

        let err = SolveResult::Failure {
            kind: TerminalKind::Exhausted,
            message: "boom".to_string(),
            attempts: 3,
        };
        assert_eq!(
            err.to_caller_json(),
            json!({"error": "boom", "attempts": 3})
        );
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let outcome = Outcome::ContractViolation {
            reason: "missing result block".to_string(),
            diagnostic: None,
        };
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(
            value,
            json!({"kind": "contract_violation", "reason": "missing result block"})
        );
        assert_eq!(
            serde_json::to_value(Outcome::Timeout).expect("serialize"),
            json!({"kind": "timeout"})
        );
    }

    #[test]
    fn program_uses_wire_field_names() {
        let program = GeneratedProgram::new("x = 1", vec!["requests".to_string()]);
        let value = serde_json::to_value(&program).expect("serialize");
        assert_eq!(value, json!({"program": "x = 1", "dependencies": ["requests"]}));
    }
}
