//! Per-attempt artifacts for `solve --artifacts DIR`.
//!
//! Layout: `<base>/<run_id>/<attempt>/{prompt.md, response.txt, program.json,
//! program.py, execution.json, attempt.json}` plus `<base>/<run_id>/result.json`.
//! Artifacts are product output and independent of `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;
use serde_json::Value;

use crate::core::session::Phase;
use crate::core::types::{ExecutionResult, FailureKind, GeneratedProgram, Outcome};

/// Summary of one attempt, written once the attempt settles.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord<'a> {
    pub attempt: u32,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<&'a Outcome>,
}

/// Summary of the whole solve.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary<'a> {
    pub run_id: &'a str,
    pub task: &'a str,
    pub attempts: u32,
    pub started_at: String,
    pub duration_ms: u64,
    pub result: Value,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub response_path: PathBuf,
    pub program_json_path: PathBuf,
    pub program_source_path: PathBuf,
    pub execution_path: PathBuf,
    pub record_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(run_dir: &Path, attempt: u32, source_suffix: &str) -> Self {
        let dir = run_dir.join(attempt.to_string());
        Self {
            prompt_path: dir.join("prompt.md"),
            response_path: dir.join("response.txt"),
            program_json_path: dir.join("program.json"),
            program_source_path: dir.join(format!("program{source_suffix}")),
            execution_path: dir.join("execution.json"),
            record_path: dir.join("attempt.json"),
            dir,
        }
    }
}

/// Writer for one solve's artifact directory.
#[derive(Debug, Clone)]
pub struct AttemptLog {
    run_id: String,
    run_dir: PathBuf,
    source_suffix: String,
}

impl AttemptLog {
    /// Create `<base>/<run_id>/`.
    pub fn create(base: &Path, run_id: &str, source_suffix: &str) -> Result<Self> {
        let run_dir = base.join(run_id);
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("create artifact dir {}", run_dir.display()))?;
        Ok(Self {
            run_id: run_id.to_string(),
            run_dir,
            source_suffix: source_suffix.to_string(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn paths(&self, attempt: u32) -> AttemptPaths {
        AttemptPaths::new(&self.run_dir, attempt, &self.source_suffix)
    }

    pub fn write_prompt(&self, attempt: u32, prompt: &str) -> Result<()> {
        let paths = self.ensure_dir(attempt)?;
        write_text(&paths.prompt_path, prompt)
    }

    pub fn write_response(&self, attempt: u32, response: &str) -> Result<()> {
        let paths = self.ensure_dir(attempt)?;
        write_text(&paths.response_path, response)
    }

    pub fn write_program(&self, attempt: u32, program: &GeneratedProgram) -> Result<()> {
        let paths = self.ensure_dir(attempt)?;
        write_json(&paths.program_json_path, program)?;
        write_text(&paths.program_source_path, &program.source)
    }

    pub fn write_execution(&self, attempt: u32, result: &ExecutionResult) -> Result<()> {
        let paths = self.ensure_dir(attempt)?;
        write_json(&paths.execution_path, result)
    }

    pub fn write_record(&self, record: &AttemptRecord<'_>) -> Result<()> {
        let paths = self.ensure_dir(record.attempt)?;
        write_json(&paths.record_path, record)
    }

    pub fn write_summary(&self, summary: &RunSummary<'_>) -> Result<()> {
        write_json(&self.run_dir.join("result.json"), summary)
    }

    fn ensure_dir(&self, attempt: u32) -> Result<AttemptPaths> {
        let paths = self.paths(attempt);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;
        Ok(paths)
    }
}

/// Timestamped run id with a short random suffix, e.g. `20261019_120501_k3x9qa`.
pub fn new_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let mut rng = rand::thread_rng();
    let suffix = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("{timestamp}_{suffix}")
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_text(path, &buf)
}
