use codeloop::core::types::SolveResult;
use serde::{Deserialize, Serialize};

use crate::judge::Judgment;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Wrong,
    Failed,
    Error,
}

pub fn classify_outcome(result: &SolveResult, judgment: &Judgment) -> Outcome {
    match result {
        SolveResult::Answer { .. } if judgment.matched => Outcome::Success,
        SolveResult::Answer { .. } => Outcome::Wrong,
        SolveResult::Failure { .. } => Outcome::Failed,
    }
}
