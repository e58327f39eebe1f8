//! Answer judging.
//!
//! Compares the solver's answer against the case's expected value. Numbers
//! compare by value so `4` and `4.0` agree; strings compare after trimming.

use codeloop::core::types::SolveResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Relative tolerance for floating point answers.
const FLOAT_TOLERANCE: f64 = 1e-9;

/// Verdict for one answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub matched: bool,
    pub expected: Option<Value>,
    pub actual: Option<Value>,
}

/// Judge a solve result. Failures never match; absent expectations accept any answer.
pub fn judge(expected: Option<&Value>, result: &SolveResult) -> Judgment {
    let actual = match result {
        SolveResult::Answer { value, .. } => Some(value.clone()),
        SolveResult::Failure { .. } => None,
    };
    let matched = match (&actual, expected) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(actual), Some(expected)) => values_match(expected, actual),
    };
    Judgment {
        matched,
        expected: expected.cloned(),
        actual,
    }
}

fn values_match(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(left), Value::Number(right)) => match (left.as_f64(), right.as_f64()) {
            (Some(left), Some(right)) => {
                let scale = left.abs().max(right.abs()).max(1.0);
                (left - right).abs() <= FLOAT_TOLERANCE * scale
            }
            _ => left == right,
        },
        (Value::String(left), Value::String(right)) => left.trim() == right.trim(),
        (Value::Array(left), Value::Array(right)) => {
            left.len() == right.len()
                && left
                    .iter()
                    .zip(right)
                    .all(|(left, right)| values_match(left, right))
        }
        (Value::Object(left), Value::Object(right)) => {
            left.len() == right.len()
                && left.iter().all(|(key, left)| {
                    right
                        .get(key)
                        .is_some_and(|right| values_match(left, right))
                })
        }
        _ => expected == actual,
    }
}
