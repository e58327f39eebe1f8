//! Stable exit codes for `codeloop` commands.

use crate::core::types::{SolveResult, TerminalKind};

/// An answer was produced (or the command succeeded).
pub const OK: i32 = 0;
/// Invalid input, config, or an internal error.
pub const INVALID: i32 = 1;
/// The model produced no usable program, or could not be reached.
pub const GENERATION: i32 = 2;
/// Every attempt failed, or `exec` produced no answer.
pub const EXHAUSTED: i32 = 3;
/// The session was cancelled.
pub const CANCELLED: i32 = 4;

pub fn for_result(result: &SolveResult) -> i32 {
    match result {
        SolveResult::Answer { .. } => OK,
        SolveResult::Failure { kind, .. } => match kind {
            TerminalKind::Generation => GENERATION,
            TerminalKind::Exhausted => EXHAUSTED,
            TerminalKind::Cancelled => CANCELLED,
            TerminalKind::Infrastructure => INVALID,
        },
    }
}
