//! Generator abstraction for model invocation.
//!
//! The [`Generator`] trait decouples the solve loop from the model backend.
//! Tests use scripted generators that return predetermined responses without
//! spawning processes or touching the network.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::io::config::{CommandSettings, GeneratorConfig};
use crate::io::gemini::{GeminiConfig, GeminiGenerator};
use crate::io::process::run_command_with_timeout;

/// Turns a prompt into raw model text.
pub trait Generator: Send + Sync {
    /// Errors are transport failures; the solve loop does not retry them.
    fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Result<String>;
}

impl<T: Generator + ?Sized> Generator for Box<T> {
    fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        (**self).generate(prompt, cancel)
    }
}

/// Generator that pipes the prompt into a command and reads the response from stdout.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandGenerator {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }

    pub fn from_settings(settings: &CommandSettings) -> Self {
        Self::new(
            settings.command.clone(),
            Duration::from_secs(settings.timeout_secs),
            settings.output_limit_bytes,
        )
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs(), prompt_bytes = prompt.len()))]
    fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("generator command is empty"))?;
        info!(command = %program, "starting generator command");

        let mut cmd = Command::new(program);
        cmd.args(args);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
            cancel,
        )
        .with_context(|| format!("run generator {program}"))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "generator timed out");
            return Err(anyhow!("generator timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "generator failed");
            return Err(anyhow!(
                "generator failed with status {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            ));
        }
        if output.stdout_truncated > 0 {
            warn!(truncated = output.stdout_truncated, "generator response truncated");
        }

        let response = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(response_bytes = response.len(), "generator completed");
        Ok(response)
    }
}

/// Build the configured generator. `api_key` is required for HTTP backends.
pub fn from_config(config: &GeneratorConfig, api_key: Option<String>) -> Result<Box<dyn Generator>> {
    match config {
        GeneratorConfig::Gemini(settings) => {
            let api_key = api_key.filter(|key| !key.trim().is_empty()).ok_or_else(|| {
                anyhow!(
                    "missing API key: set {} or switch generator.kind to \"command\"",
                    settings.api_key_env
                )
            })?;
            let generator = GeminiGenerator::new(GeminiConfig {
                api_key,
                model: settings.model.clone(),
                base_url: settings.api_base.clone(),
                temperature: settings.temperature,
                timeout: Duration::from_secs(settings.timeout_secs),
            })?;
            Ok(Box::new(generator))
        }
        GeneratorConfig::Command(settings) => Ok(Box::new(CommandGenerator::from_settings(settings))),
    }
}
