//! Dependency installation adapter.
//!
//! Installs mutate a shared environment, so every install in the process holds
//! a global lock. Names are installed one at a time in the order given.

use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::io::config::InstallerConfig;
use crate::io::process::{Cancelled, run_command_with_timeout};

const INSTALL_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Result of installing a single package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStatus {
    Installed,
    Failed { diagnostic: String },
    TimedOut,
}

/// A dependency could not be installed; the program should be regenerated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to install {package}: {diagnostic}")]
pub struct DependencyFailure {
    pub package: String,
    pub diagnostic: String,
}

/// Dependency installation collaborator.
pub trait Installer: Send + Sync {
    fn install(&self, package: &str, cancel: &CancellationToken) -> Result<InstallStatus>;
}

/// Installer that runs a configured command with the package name appended.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandInstaller {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    pub fn from_config(config: &InstallerConfig) -> Self {
        Self::new(
            config.command.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }
}

impl Installer for CommandInstaller {
    #[instrument(skip_all, fields(package = %package))]
    fn install(&self, package: &str, cancel: &CancellationToken) -> Result<InstallStatus> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("installer command is empty"))?;

        let _guard = INSTALL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        debug!("running installer");
        let mut cmd = Command::new(program);
        cmd.args(args).arg(package);
        let output = match run_command_with_timeout(
            cmd,
            None,
            self.timeout,
            INSTALL_OUTPUT_LIMIT_BYTES,
            cancel,
        ) {
            Ok(output) => output,
            Err(e) if e.is::<Cancelled>() => return Err(e),
            Err(e) => {
                return Ok(InstallStatus::Failed {
                    diagnostic: format!("{e:#}"),
                });
            }
        };

        if output.timed_out {
            return Ok(InstallStatus::TimedOut);
        }
        if !output.status.success() {
            let stderr = output.stderr_text();
            let diagnostic = if stderr.trim().is_empty() {
                format!("installer exited with status {:?}", output.status.code())
            } else {
                stderr.trim().to_string()
            };
            return Ok(InstallStatus::Failed { diagnostic });
        }
        Ok(InstallStatus::Installed)
    }
}

/// Install `dependencies` in order, stopping at the first hard failure.
///
/// Timed-out installs are logged and skipped. The outer error carries a
/// [`DependencyFailure`] or [`Cancelled`] for callers to downcast.
#[instrument(skip_all, fields(count = dependencies.len()))]
pub fn install_dependencies<I: Installer + ?Sized>(
    installer: &I,
    dependencies: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    for package in dependencies {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        if let Some(problem) = invalid_package_name(package) {
            warn!(package = %package, problem, "rejecting dependency name");
            return Err(DependencyFailure {
                package: package.clone(),
                diagnostic: problem.to_string(),
            }
            .into());
        }

        match installer.install(package, cancel)? {
            InstallStatus::Installed => info!(package = %package, "dependency installed"),
            InstallStatus::TimedOut => {
                warn!(package = %package, "dependency install timed out, continuing");
            }
            InstallStatus::Failed { diagnostic } => {
                warn!(package = %package, "dependency install failed");
                return Err(DependencyFailure {
                    package: package.clone(),
                    diagnostic,
                }
                .into());
            }
        }
    }
    Ok(())
}

fn invalid_package_name(name: &str) -> Option<&'static str> {
    if name.is_empty() {
        return Some("empty package name");
    }
    if name.starts_with('-') {
        return Some("package name looks like a command-line option");
    }
    if name.chars().any(char::is_whitespace) {
        return Some("package name contains whitespace");
    }
    None
}
