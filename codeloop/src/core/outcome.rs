//! Deterministic classification of captured output into an [`Outcome`].

use serde_json::Value;

use crate::core::contract::{BlockScan, find_error_message, scan_result_block};
use crate::core::types::{ExecutionResult, Outcome};

pub const REASON_MALFORMED: &str = "malformed payload";
pub const REASON_UNTERMINATED: &str = "unterminated result block";
pub const REASON_MISSING: &str = "missing result block";
pub const REASON_NO_OUTPUT: &str = "no output produced";

/// Classify an execution result against the result protocol.
///
/// Precedence: timeout, non-zero exit, first result block, error line, then the
/// missing-output cases.
pub fn classify_outcome(result: &ExecutionResult) -> Outcome {
    if result.timed_out {
        return Outcome::Timeout;
    }

    if result.exit_code != Some(0) {
        return Outcome::RuntimeFailure {
            diagnostic: runtime_diagnostic(result),
        };
    }

    match scan_result_block(&result.stdout) {
        BlockScan::Complete(payload) => match serde_json::from_str::<Value>(payload) {
            Ok(value) => Outcome::Success { value },
            Err(err) => Outcome::ContractViolation {
                reason: REASON_MALFORMED.to_string(),
                diagnostic: Some(format!("{err}\npayload:\n{payload}")),
            },
        },
        BlockScan::Unterminated => Outcome::ContractViolation {
            reason: REASON_UNTERMINATED.to_string(),
            diagnostic: Some(result.stdout.trim().to_string()),
        },
        BlockScan::Missing => {
            if let Some(message) = find_error_message(&result.stdout) {
                return Outcome::RuntimeFailure {
                    diagnostic: message.to_string(),
                };
            }
            let stdout = result.stdout.trim();
            if stdout.is_empty() {
                Outcome::ContractViolation {
                    reason: REASON_NO_OUTPUT.to_string(),
                    diagnostic: None,
                }
            } else {
                Outcome::ContractViolation {
                    reason: REASON_MISSING.to_string(),
                    diagnostic: Some(stdout.to_string()),
                }
            }
        }
    }
}

fn runtime_diagnostic(result: &ExecutionResult) -> String {
    let stderr = result.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    if let Some(message) = find_error_message(&result.stdout) {
        return message.to_string();
    }
    match result.exit_code {
        Some(code) => format!("program exited with status {code}"),
        None => "program was terminated by a signal".to_string(),
    }
}
