//! Sandboxed execution of generated programs.
//!
//! The [`Sandbox`] trait decouples the solve loop from process spawning. Each
//! run gets a private temporary directory that is removed on every exit path.
//! The sandbox captures output verbatim and never interprets it.

use std::io::Write;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::types::ExecutionResult;
use crate::io::config::SandboxConfig;
use crate::io::process::run_command_with_timeout;

const SYNTAX_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Process execution boundary for generated programs.
pub trait Sandbox: Send + Sync {
    /// Run `source` to completion, timeout, or cancellation.
    ///
    /// Errors mean the program could not be run at all (missing interpreter,
    /// unwritable temp dir) or the run was cancelled.
    fn run(
        &self,
        source: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult>;

    /// Cheap pre-flight check. Returns a diagnostic when the source is rejected.
    fn check_syntax(&self, source: &str) -> Option<String>;
}

/// Sandbox that writes the program to a temp file and runs an interpreter on it.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    interpreter: Vec<String>,
    file_suffix: String,
    output_limit_bytes: usize,
    syntax_check: Vec<String>,
}

impl ProcessSandbox {
    pub fn new(interpreter: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            interpreter,
            file_suffix: ".py".to_string(),
            output_limit_bytes,
            syntax_check: Vec::new(),
        }
    }

    pub fn from_config(config: &SandboxConfig, output_limit_bytes: usize) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            file_suffix: config.file_suffix.clone(),
            output_limit_bytes,
            syntax_check: config.syntax_check.clone(),
        }
    }

    pub fn with_file_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.file_suffix = suffix.into();
        self
    }

    pub fn with_syntax_check(mut self, command: Vec<String>) -> Self {
        self.syntax_check = command;
        self
    }
}

impl Sandbox for ProcessSandbox {
    #[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, source_bytes = source.len()))]
    fn run(
        &self,
        source: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let (program, args) = self
            .interpreter
            .split_first()
            .ok_or_else(|| anyhow!("sandbox interpreter is empty"))?;

        let workdir = tempfile::Builder::new()
            .prefix("codeloop-run-")
            .tempdir()
            .context("create sandbox directory")?;
        let mut file = tempfile::Builder::new()
            .prefix("program-")
            .suffix(&self.file_suffix)
            .tempfile_in(workdir.path())
            .context("create program file")?;
        file.write_all(source.as_bytes())
            .context("write program file")?;
        file.flush().context("flush program file")?;
        debug!(path = %file.path().display(), "program written");

        let mut cmd = Command::new(program);
        cmd.args(args).arg(file.path()).current_dir(workdir.path());

        let output = run_command_with_timeout(
            cmd,
            None,
            timeout,
            self.output_limit_bytes,
            cancel,
        )
        .with_context(|| format!("run program with {program}"))?;

        let result = ExecutionResult {
            exit_code: if output.timed_out {
                None
            } else {
                output.status.code()
            },
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            timed_out: output.timed_out,
            stdout_truncated: output.stdout_truncated,
            stderr_truncated: output.stderr_truncated,
            duration: output.duration,
        };
        info!(
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            duration_ms = result.duration.as_millis() as u64,
            "program finished"
        );

        drop(file);
        if let Err(e) = workdir.close() {
            warn!(err = %e, "failed to remove sandbox directory");
        }
        Ok(result)
    }

    fn check_syntax(&self, source: &str) -> Option<String> {
        let (program, args) = self.syntax_check.split_first()?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        let output = match run_command_with_timeout(
            cmd,
            Some(source.as_bytes()),
            SYNTAX_CHECK_TIMEOUT,
            self.output_limit_bytes,
            &CancellationToken::new(),
        ) {
            Ok(output) => output,
            Err(e) => {
                // A broken checker must not block execution.
                warn!(err = %format!("{e:#}"), "syntax check unavailable");
                return None;
            }
        };
        if output.timed_out || output.status.success() {
            return None;
        }
        let stderr = output.stderr_text();
        let diagnostic = if stderr.trim().is_empty() {
            output.stdout_text()
        } else {
            stderr
        };
        Some(diagnostic.trim().to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Instant;

    fn sh_sandbox() -> ProcessSandbox {
        ProcessSandbox::new(vec!["sh".to_string()], 4096).with_file_suffix(".sh")
    }

    #[test]
    fn runs_program_from_private_directory() {
        let sandbox = sh_sandbox();
        let result = sandbox
            .run(
                "echo start\npwd\necho oops >&2\nexit 4\n",
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .expect("run");
        assert_eq!(result.exit_code, Some(4));
        assert!(result.stdout.starts_with("start\n"));
        assert_eq!(result.stderr, "oops\n");

        let workdir = result.stdout.lines().nth(1).expect("pwd line").to_string();
        assert!(workdir.contains("codeloop-run-"), "workdir: {workdir}");
        assert!(!fs::exists(&workdir).expect("stat"), "sandbox dir removed");
    }

    #[test]
    fn timeout_returns_promptly() {
        let sandbox = sh_sandbox();
        let started = Instant::now();
        let result = sandbox
            .run(
                "while true; do :; done\n",
                Duration::from_millis(300),
                &CancellationToken::new(),
            )
            .expect("run");
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_interpreter_is_an_error() {
        let sandbox = ProcessSandbox::new(vec!["/nonexistent/python3".to_string()], 1024);
        let err = sandbox
            .run("print(1)", Duration::from_secs(1), &CancellationToken::new())
            .expect_err("no interpreter");
        assert!(format!("{err:#}").contains("spawn command"));
    }

    #[test]
    fn syntax_check_reports_diagnostics() {
        let sandbox = sh_sandbox().with_syntax_check(vec!["sh".to_string(), "-n".to_string()]);
        assert_eq!(sandbox.check_syntax("echo fine\n"), None);
        let diagnostic = sandbox
            .check_syntax("if then fi (\n")
            .expect("syntax error");
        assert!(!diagnostic.is_empty());
    }

    #[test]
    fn no_syntax_check_configured_accepts_everything() {
        assert_eq!(sh_sandbox().check_syntax("this is not shell ((("), None);
    }
}
