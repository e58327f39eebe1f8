//! Scripted collaborators for exercising the solve loop without processes or network.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::core::contract::render_result_block;
use crate::core::types::ExecutionResult;
use crate::io::generator::Generator;
use crate::io::installer::{InstallStatus, Installer};
use crate::io::process::Cancelled;
use crate::io::sandbox::Sandbox;

/// Fenced JSON response in the shape the model is asked to produce.
pub fn program_response(source: &str, dependencies: &[&str]) -> String {
    let body = json!({ "program": source, "dependencies": dependencies });
    format!("```json\n{body}\n```")
}

/// Generator that replays queued responses and records every prompt it saw.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<Result<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts().len()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("scripted generator has no responses left")))
    }
}

/// Installer that succeeds unless a package is scripted to fail or time out.
#[derive(Debug, Default)]
pub struct ScriptedInstaller {
    failures: Vec<(String, String)>,
    timeouts: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedInstaller {
    pub fn failing(mut self, package: &str, diagnostic: &str) -> Self {
        self.failures
            .push((package.to_string(), diagnostic.to_string()));
        self
    }

    pub fn timing_out(mut self, package: &str) -> Self {
        self.timeouts.push(package.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Installer for ScriptedInstaller {
    fn install(&self, package: &str, cancel: &CancellationToken) -> Result<InstallStatus> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(package.to_string());
        if let Some((_, diagnostic)) = self.failures.iter().find(|(name, _)| name == package) {
            return Ok(InstallStatus::Failed {
                diagnostic: diagnostic.clone(),
            });
        }
        if self.timeouts.iter().any(|name| name == package) {
            return Ok(InstallStatus::TimedOut);
        }
        Ok(InstallStatus::Installed)
    }
}

/// Scripted result of one sandbox run.
#[derive(Debug, Clone)]
pub enum SandboxScript {
    /// Exit 0 with a well-formed result block around `value`.
    Answer(Value),
    /// Exit with `exit_code` and the given streams.
    Output {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    Timeout,
    /// The program could not be started at all.
    Unavailable(String),
    /// Cancel the given token mid-run, then report cancellation.
    CancelDuringRun(CancellationToken),
}

impl SandboxScript {
    pub fn stdout(stdout: &str) -> Self {
        SandboxScript::Output {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn crash(stderr: &str) -> Self {
        SandboxScript::Output {
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// Sandbox that replays queued results and records the sources it was asked to run.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    runs: Mutex<VecDeque<SandboxScript>>,
    sources: Mutex<Vec<String>>,
    timeouts: Mutex<Vec<Duration>>,
}

impl ScriptedSandbox {
    pub fn new(runs: Vec<SandboxScript>) -> Self {
        Self {
            runs: Mutex::new(runs.into()),
            sources: Mutex::new(Vec::new()),
            timeouts: Mutex::new(Vec::new()),
        }
    }

    pub fn sources(&self) -> Vec<String> {
        self.sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.timeouts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn execution(exit_code: Option<i32>, stdout: String, stderr: String, timed_out: bool) -> ExecutionResult {
    ExecutionResult {
        exit_code,
        stdout,
        stderr,
        timed_out,
        stdout_truncated: 0,
        stderr_truncated: 0,
        duration: Duration::from_millis(1),
    }
}

impl Sandbox for ScriptedSandbox {
    fn run(
        &self,
        source: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        self.sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(source.to_string());
        self.timeouts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(timeout);
        let script = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| anyhow!("scripted sandbox has no runs left"))?;

        match script {
            SandboxScript::Answer(value) => Ok(execution(
                Some(0),
                render_result_block(&value),
                String::new(),
                false,
            )),
            SandboxScript::Output {
                exit_code,
                stdout,
                stderr,
            } => Ok(execution(Some(exit_code), stdout, stderr, false)),
            SandboxScript::Timeout => Ok(execution(None, String::new(), String::new(), true)),
            SandboxScript::Unavailable(message) => Err(anyhow!(message)),
            SandboxScript::CancelDuringRun(token) => {
                token.cancel();
                Err(Cancelled.into())
            }
        }
    }

    fn check_syntax(&self, _source: &str) -> Option<String> {
        None
    }
}
