//! Solver configuration merging.
//!
//! Applies case-specific overrides to the base solver configuration.

use anyhow::Result;
use codeloop::io::config::SolverConfig;

use crate::case::CaseConfig;

/// Apply case configuration overrides to the base solver config.
pub fn apply_case_config(mut base: SolverConfig, overrides: &CaseConfig) -> Result<SolverConfig> {
    if let Some(max_attempts) = overrides.max_attempts {
        base.max_attempts = max_attempts;
    }
    if let Some(exec_timeout_secs) = overrides.exec_timeout_secs {
        base.exec_timeout_secs = exec_timeout_secs;
    }
    base.validate()?;
    Ok(base)
}
