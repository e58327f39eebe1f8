//! Case execution orchestration.
//!
//! Builds a solver from the merged configuration, solves the case task
//! in-process, judges the answer and captures results.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use codeloop::core::types::SolveResult;
use codeloop::io::attempt_log::{AttemptLog, new_run_id};
use codeloop::io::config::{GeneratorConfig, SolverConfig};
use codeloop::io::generator;
use codeloop::io::installer::CommandInstaller;
use codeloop::io::prompt::PromptBuilder;
use codeloop::io::sandbox::ProcessSandbox;
use codeloop::solve::{SolveOptions, Solver};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::case::CaseFile;
use crate::config::apply_case_config;
use crate::judge::judge;
use crate::outcome::{Outcome, classify_outcome};
use crate::results::{CaptureInput, capture_results, results_dir};

/// Result of running a single case.
#[derive(Debug)]
pub struct RunOutcome {
    /// Unique identifier for this eval run.
    pub eval_run_id: String,
    /// Path to the results directory.
    pub results_dir: PathBuf,
    /// Classified outcome.
    pub outcome: Outcome,
}

/// Run a case end-to-end with the solver described by `base`.
#[instrument(skip_all, fields(case_id = %case.case.id))]
pub fn run_case(
    results_base: &Path,
    case_path: &Path,
    case: &CaseFile,
    base: &SolverConfig,
) -> Result<RunOutcome> {
    execute_case(results_base, case_path, case, |task, artifacts| {
        let cfg = apply_case_config(base.clone(), &case.config)?;
        solve_with_config(&cfg, task, artifacts)
    })
}

/// Run `solve` for a case and record the outcome.
///
/// `solve` receives the task and the directory for per-attempt artifacts. An
/// error from it is a harness failure and classifies the run as `error`.
pub fn execute_case<F>(
    results_base: &Path,
    case_path: &Path,
    case: &CaseFile,
    solve: F,
) -> Result<RunOutcome>
where
    F: FnOnce(&str, &Path) -> Result<SolveResult>,
{
    info!("case run started");
    let eval_run_id = format!("eval-{}", new_run_id());
    let run_dir = results_dir(results_base, &case.case.id, &eval_run_id);
    let expected = case.expected_json()?;

    let started_at = Utc::now();
    let solved = solve(&case.case.task, &run_dir);
    let finished_at = Utc::now();

    let (result, judgment, outcome) = match &solved {
        Ok(result) => {
            let judgment = judge(expected.as_ref(), result);
            let outcome = classify_outcome(result, &judgment);
            (Ok(result), Some(judgment), outcome)
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "harness failed to solve case");
            (Err(format!("{err:#}")), None, Outcome::Error)
        }
    };

    let results_dir = capture_results(
        results_base,
        &CaptureInput {
            case_id: &case.case.id,
            case_path,
            eval_run_id: &eval_run_id,
            started_at,
            finished_at,
            result,
            judgment: judgment.as_ref(),
            outcome,
        },
    )
    .context("capture results")?;

    info!(outcome = ?outcome, results_dir = %results_dir.display(), "case run complete");
    Ok(RunOutcome {
        eval_run_id,
        results_dir,
        outcome,
    })
}

fn solve_with_config(cfg: &SolverConfig, task: &str, run_dir: &Path) -> Result<SolveResult> {
    let api_key = match &cfg.generator {
        GeneratorConfig::Gemini(settings) => std::env::var(&settings.api_key_env).ok(),
        GeneratorConfig::Command(_) => None,
    };
    let generator = generator::from_config(&cfg.generator, api_key)?;
    let solver = Solver::new(
        generator,
        CommandInstaller::from_config(&cfg.installer),
        ProcessSandbox::from_config(&cfg.sandbox, cfg.output_limit_bytes),
        PromptBuilder::new(cfg.feedback_budget_bytes)?,
        SolveOptions::from_config(cfg),
    )
    .with_artifacts(AttemptLog::create(run_dir, "attempts", &cfg.sandbox.file_suffix)?);
    Ok(solver.solve(task, &CancellationToken::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::read_meta;
    use anyhow::anyhow;
    use codeloop::core::types::TerminalKind;
    use codeloop::test_support::{
        SandboxScript, ScriptedGenerator, ScriptedInstaller, ScriptedSandbox, program_response,
    };
    use serde_json::json;
    use std::fs;

    fn case(temp: &Path, expected: &str) -> (PathBuf, CaseFile) {
        let path = temp.join("sum.toml");
        fs::write(
            &path,
            format!("[case]\nid = \"sum\"\ntask = \"What is 2+2?\"\n{expected}\n"),
        )
        .expect("write case");
        let case = CaseFile::load(&path).expect("load case");
        (path, case)
    }

    fn scripted_solve(value: serde_json::Value) -> impl FnOnce(&str, &Path) -> Result<SolveResult> {
        move |task: &str, _: &Path| {
            let solver = Solver::new(
                ScriptedGenerator::new(vec![Ok(program_response("print(4)", &[]))]),
                ScriptedInstaller::default(),
                ScriptedSandbox::new(vec![SandboxScript::Answer(value)]),
                PromptBuilder::new(1_000)?,
                SolveOptions::default(),
            );
            Ok(solver.solve(task, &CancellationToken::new()))
        }
    }

    #[test]
    fn matching_answer_is_success() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (path, case) = case(temp.path(), "expected = 4");
        let results = temp.path().join("results");

        let run = execute_case(&results, &path, &case, scripted_solve(json!(4))).expect("run");
        assert_eq!(run.outcome, Outcome::Success);
        assert!(run.eval_run_id.starts_with("eval-"));
        assert!(run.results_dir.starts_with(results.join("sum")));

        let meta = read_meta(&run.results_dir.join("meta.json")).expect("meta");
        assert_eq!(meta.attempts, 1);
        assert_eq!(meta.answer, Some(json!(4)));
    }

    #[test]
    fn mismatched_answer_is_wrong() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (path, case) = case(temp.path(), "expected = 5");
        let run = execute_case(temp.path(), &path, &case, scripted_solve(json!(4))).expect("run");
        assert_eq!(run.outcome, Outcome::Wrong);
    }

    #[test]
    fn terminal_failure_is_failed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (path, case) = case(temp.path(), "");
        let run = execute_case(temp.path(), &path, &case, |_, _| {
            Ok(SolveResult::Failure {
                kind: TerminalKind::Generation,
                message: "no program".to_string(),
                attempts: 1,
            })
        })
        .expect("run");
        assert_eq!(run.outcome, Outcome::Failed);
    }

    #[test]
    fn harness_error_is_recorded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (path, case) = case(temp.path(), "expected = 4");
        let run = execute_case(temp.path(), &path, &case, |_, _| {
            Err(anyhow!("missing API key: set GEMINI_API_KEY"))
        })
        .expect("run");
        assert_eq!(run.outcome, Outcome::Error);
        let meta = read_meta(&run.results_dir.join("meta.json")).expect("meta");
        assert!(meta.error.expect("error").contains("GEMINI_API_KEY"));
    }
}
