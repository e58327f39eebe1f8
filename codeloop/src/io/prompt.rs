//! Prompt rendering for generation, regeneration and task refinement.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::contract::{ERROR_MARKER, RESULT_END, RESULT_START};
use crate::core::session::Feedback;

const CONTRACT_TEMPLATE: &str = include_str!("prompts/contract.md");
const GENERATE_TEMPLATE: &str = include_str!("prompts/generate.md");
const RETRY_TEMPLATE: &str = include_str!("prompts/retry.md");
const REFINE_TEMPLATE: &str = include_str!("prompts/refine.md");

const TRUNCATED_MARKER: &str = "[truncated]";

/// Renders prompts from embedded templates, bounding retry feedback to a byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    feedback_budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(feedback_budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("contract", CONTRACT_TEMPLATE)
            .context("load contract template")?;
        env.add_template("generate", GENERATE_TEMPLATE)
            .context("load generate template")?;
        env.add_template("retry", RETRY_TEMPLATE)
            .context("load retry template")?;
        env.add_template("refine", REFINE_TEMPLATE)
            .context("load refine template")?;
        Ok(Self {
            env,
            feedback_budget_bytes,
        })
    }

    /// First-attempt prompt for `task`.
    pub fn generation(&self, task: &str) -> Result<String> {
        let template = self.env.get_template("generate")?;
        let rendered = template
            .render(context! {
                task => task.trim(),
                start => RESULT_START,
                end => RESULT_END,
                error => ERROR_MARKER,
            })
            .context("render generate prompt")?;
        Ok(rendered)
    }

    /// Retry prompt carrying the previous program and its diagnostic.
    ///
    /// Each of the two is bounded by half the feedback budget. The program keeps
    /// its head and the diagnostic keeps its tail, where tracebacks end.
    pub fn regeneration(&self, task: &str, feedback: &Feedback<'_>) -> Result<String> {
        let half = self.feedback_budget_bytes / 2;
        let program = truncate_head(feedback.program.source.trim(), half);
        let diagnostic = truncate_tail(feedback.failure.diagnostic.trim(), half);
        debug!(
            attempt = feedback.attempt,
            program_bytes = program.len(),
            diagnostic_bytes = diagnostic.len(),
            "rendering retry prompt"
        );

        let template = self.env.get_template("retry")?;
        let rendered = template
            .render(context! {
                task => task.trim(),
                start => RESULT_START,
                end => RESULT_END,
                error => ERROR_MARKER,
                attempt => feedback.attempt,
                program => program,
                failure_kind => feedback.failure.kind.as_str(),
                diagnostic => diagnostic,
            })
            .context("render retry prompt")?;
        Ok(rendered)
    }

    /// Prompt that rewrites a raw request into a precise task statement.
    pub fn refinement(&self, request: &str) -> Result<String> {
        let template = self.env.get_template("refine")?;
        let rendered = template
            .render(context! { request => request.trim() })
            .context("render refine prompt")?;
        Ok(rendered)
    }
}

/// Keep the first `budget` bytes, marking the cut.
fn truncate_head(text: &str, budget: usize) -> String {
    if text.len() <= budget {
        return text.to_string();
    }
    let keep = floor_char_boundary(text, budget.saturating_sub(TRUNCATED_MARKER.len() + 1));
    format!("{}\n{TRUNCATED_MARKER}", &text[..keep])
}

/// Keep the last `budget` bytes, marking the cut.
pub(crate) fn truncate_tail(text: &str, budget: usize) -> String {
    if text.len() <= budget {
        return text.to_string();
    }
    let keep = budget.saturating_sub(TRUNCATED_MARKER.len() + 1);
    let mut start = text.len() - keep;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("{TRUNCATED_MARKER}\n{}", &text[start..])
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::AttemptFailure;
    use crate::core::types::{FailureKind, GeneratedProgram};

    fn builder() -> PromptBuilder {
        PromptBuilder::new(20_000).expect("builder")
    }

    #[test]
    fn generation_prompt_states_protocol_and_task() {
        let prompt = builder()
            .generation("  What is 2+2?  ")
            .expect("render");
        assert!(prompt.contains("FINAL_OUTPUT_START"));
        assert!(prompt.contains("FINAL_OUTPUT_END"));
        assert!(prompt.contains("FINAL_OUTPUT_ERROR:"));
        assert!(prompt.contains(r#"{"program": "#));
        assert!(prompt.contains("<task>\nWhat is 2+2?\n</task>"));
    }

    #[test]
    fn retry_prompt_carries_program_and_diagnostic() {
        let program = GeneratedProgram::new("print(1/0)", Vec::new());
        let failure = AttemptFailure {
            kind: FailureKind::RuntimeFailure,
            diagnostic: "ZeroDivisionError: division by zero".to_string(),
        };
        let feedback = Feedback {
            attempt: 1,
            program: &program,
            failure: &failure,
        };
        let prompt = builder()
            .regeneration("What is 2+2?", &feedback)
            .expect("render");
        assert!(prompt.contains("<previous_attempt number=\"1\">"));
        assert!(prompt.contains("print(1/0)"));
        assert!(prompt.contains("<failure kind=\"runtime_failure\">"));
        assert!(prompt.contains("ZeroDivisionError"));
        assert!(prompt.contains("FINAL_OUTPUT_START"));
    }

    #[test]
    fn retry_feedback_respects_budget() {
        let program = GeneratedProgram::new("x = 1\n".repeat(1000), Vec::new());
        let failure = AttemptFailure {
            kind: FailureKind::ContractViolation,
            diagnostic: format!("{}LAST LINE", "noise\n".repeat(1000)),
        };
        let feedback = Feedback {
            attempt: 2,
            program: &program,
            failure: &failure,
        };
        let builder = PromptBuilder::new(400).expect("builder");
        let prompt = builder.regeneration("task", &feedback).expect("render");
        let unbounded = PromptBuilder::new(1_000_000)
            .expect("builder")
            .regeneration("task", &feedback)
            .expect("render");

        assert!(prompt.len() < unbounded.len());
        assert!(prompt.contains("[truncated]"));
        assert!(prompt.contains("LAST LINE"), "diagnostic tail kept");
    }

    #[test]
    fn refinement_prompt_wraps_request() {
        let prompt = builder()
            .refinement("visit https://example.com/quiz and answer")
            .expect("render");
        assert!(prompt.contains("https://example.com/quiz"));
        assert!(prompt.contains("<request>"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(50);
        let head = truncate_head(&text, 31);
        assert!(head.ends_with(TRUNCATED_MARKER));
        assert!(head.len() <= 31);

        let tail = truncate_tail(&text, 31);
        assert!(tail.starts_with(TRUNCATED_MARKER));
        assert!(tail.len() <= 31);

        assert_eq!(truncate_head("short", 100), "short");
        assert_eq!(truncate_tail("short", 100), "short");
    }
}
