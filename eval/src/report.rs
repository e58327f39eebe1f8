use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::outcome::Outcome;
use crate::results::read_meta;

#[derive(Debug, Default, PartialEq)]
pub struct ReportSummary {
    pub runs: usize,
    pub success: usize,
    pub wrong: usize,
    pub failed: usize,
    pub error: usize,
    pub avg_duration_secs: Option<f64>,
    /// Average over runs where the solver started.
    pub avg_attempts: Option<f64>,
}

pub fn load_run_dirs(case_results_dir: &Path) -> Result<Vec<PathBuf>> {
    if !case_results_dir.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(case_results_dir)
        .with_context(|| format!("read {}", case_results_dir.display()))?
    {
        let entry = entry.context("read entry")?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

pub fn aggregate(case_results_dir: &Path) -> Result<(ReportSummary, Vec<String>)> {
    let mut summary = ReportSummary::default();
    let mut warnings = Vec::new();
    let mut total_duration = 0.0;
    let mut total_attempts = 0u64;
    let mut solved_runs = 0u64;

    for run_dir in load_run_dirs(case_results_dir)? {
        let meta = match read_meta(&run_dir.join("meta.json")) {
            Ok(meta) => meta,
            Err(err) => {
                warnings.push(format!(
                    "skip {}: meta.json invalid ({err:#})",
                    run_dir.display()
                ));
                continue;
            }
        };

        summary.runs += 1;
        match meta.outcome {
            Outcome::Success => summary.success += 1,
            Outcome::Wrong => summary.wrong += 1,
            Outcome::Failed => summary.failed += 1,
            Outcome::Error => summary.error += 1,
        }
        total_duration += meta.duration_secs;
        if meta.attempts > 0 {
            total_attempts += u64::from(meta.attempts);
            solved_runs += 1;
        }
    }

    if summary.runs > 0 {
        summary.avg_duration_secs = Some(total_duration / summary.runs as f64);
    }
    if solved_runs > 0 {
        summary.avg_attempts = Some(total_attempts as f64 / solved_runs as f64);
    }
    Ok((summary, warnings))
}
