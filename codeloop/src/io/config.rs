//! Solver configuration stored in `codeloop.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "codeloop.toml";

/// Solver configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields fall back to
/// the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SolverConfig {
    /// Maximum generate/execute cycles per task.
    pub max_attempts: u32,

    /// Wall-clock limit for a single program run.
    pub exec_timeout_secs: u64,

    /// Overall budget for one solve, across all attempts. `0` disables it.
    pub solve_timeout_secs: u64,

    /// Per-stream cap on captured program output.
    pub output_limit_bytes: usize,

    /// Bound on the failing program plus diagnostic fed back into a retry prompt.
    pub feedback_budget_bytes: usize,

    /// Rewrite the raw request into a precise task before solving.
    pub refine_task: bool,

    /// Consecutive timeouts after which the diagnostic flags a likely infinite loop.
    pub repeated_timeout_threshold: u32,

    pub sandbox: SandboxConfig,
    pub installer: InstallerConfig,
    pub generator: GeneratorConfig,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            exec_timeout_secs: 120,
            solve_timeout_secs: 15 * 60,
            output_limit_bytes: 4_000_000,
            feedback_budget_bytes: 20_000,
            refine_task: false,
            repeated_timeout_threshold: 2,
            sandbox: SandboxConfig::default(),
            installer: InstallerConfig::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter argv; the program path is appended.
    pub interpreter: Vec<String>,
    pub file_suffix: String,
    /// Optional syntax check argv, fed the source on stdin. Empty disables it.
    pub syntax_check: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string()],
            file_suffix: ".py".to_string(),
            syntax_check: vec![
                "python3".to_string(),
                "-c".to_string(),
                "import ast, sys; ast.parse(sys.stdin.read())".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InstallerConfig {
    /// Install argv; the package name is appended.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "python3".to_string(),
                "-m".to_string(),
                "pip".to_string(),
                "install".to_string(),
            ],
            timeout_secs: 300,
        }
    }
}

/// Backend used to turn prompts into model responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeneratorConfig {
    Gemini(GeminiSettings),
    /// Any command that reads a prompt on stdin and prints a response.
    Command(CommandSettings),
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig::Gemini(GeminiSettings::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeminiSettings {
    pub model: String,
    pub api_base: String,
    /// Environment variable holding the API key; read once by the CLI.
    pub api_key_env: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash".to_string(),
            api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            temperature: 0.2,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandSettings {
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 120,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.exec_timeout_secs == 0 {
            return Err(anyhow!("exec_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.feedback_budget_bytes < 64 {
            return Err(anyhow!("feedback_budget_bytes must be >= 64"));
        }
        if self.repeated_timeout_threshold == 0 {
            return Err(anyhow!("repeated_timeout_threshold must be > 0"));
        }
        ensure_argv(&self.sandbox.interpreter, "sandbox.interpreter")?;
        ensure_argv(&self.installer.command, "installer.command")?;
        if self.installer.timeout_secs == 0 {
            return Err(anyhow!("installer.timeout_secs must be > 0"));
        }
        match &self.generator {
            GeneratorConfig::Gemini(gemini) => {
                if gemini.model.trim().is_empty() {
                    return Err(anyhow!("generator.model must be set"));
                }
                if gemini.api_key_env.trim().is_empty() {
                    return Err(anyhow!("generator.api_key_env must be set"));
                }
                if gemini.timeout_secs == 0 {
                    return Err(anyhow!("generator.timeout_secs must be > 0"));
                }
            }
            GeneratorConfig::Command(command) => {
                ensure_argv(&command.command, "generator.command")?;
                if command.timeout_secs == 0 {
                    return Err(anyhow!("generator.timeout_secs must be > 0"));
                }
            }
        }
        Ok(())
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    /// Overall solve budget, or `None` when disabled.
    pub fn solve_timeout(&self) -> Option<Duration> {
        (self.solve_timeout_secs > 0).then(|| Duration::from_secs(self.solve_timeout_secs))
    }
}

fn ensure_argv(argv: &[String], field: &str) -> Result<()> {
    match argv.first() {
        Some(program) if !program.trim().is_empty() => Ok(()),
        _ => Err(anyhow!("{field} must be a non-empty array")),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SolverConfig::default()`.
pub fn load_config(path: &Path) -> Result<SolverConfig> {
    if !path.exists() {
        let cfg = SolverConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SolverConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SolverConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, SolverConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("codeloop.toml");
        let mut cfg = SolverConfig::default();
        cfg.generator = GeneratorConfig::Command(CommandSettings {
            command: vec!["llm".to_string(), "-m".to_string(), "local".to_string()],
            ..CommandSettings::default()
        });
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert!(!temp.path().join("codeloop.toml.tmp").exists());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("codeloop.toml");
        fs::write(
            &path,
            "max_attempts = 5\n\n[sandbox]\ninterpreter = [\"python3.12\"]\n\n[generator]\nkind = \"gemini\"\nmodel = \"gemini-2.5-pro\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.sandbox.interpreter, vec!["python3.12"]);
        assert_eq!(cfg.sandbox.file_suffix, ".py");
        assert_eq!(cfg.exec_timeout_secs, 120);
        match cfg.generator {
            GeneratorConfig::Gemini(gemini) => {
                assert_eq!(gemini.model, "gemini-2.5-pro");
                assert_eq!(gemini.api_key_env, "GEMINI_API_KEY");
            }
            other => panic!("unexpected generator {other:?}"),
        }
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut cfg = SolverConfig {
            max_attempts: 0,
            ..SolverConfig::default()
        };
        assert!(cfg.validate().is_err());

        cfg.max_attempts = 1;
        cfg.sandbox.interpreter = Vec::new();
        assert!(cfg.validate().is_err());

        cfg.sandbox = SandboxConfig::default();
        cfg.generator = GeneratorConfig::Command(CommandSettings::default());
        let err = cfg.validate().expect_err("empty generator command");
        assert!(err.to_string().contains("generator.command"));
    }

    #[test]
    fn solve_timeout_zero_disables_budget() {
        let cfg = SolverConfig {
            solve_timeout_secs: 0,
            ..SolverConfig::default()
        };
        assert_eq!(cfg.solve_timeout(), None);
        assert_eq!(
            SolverConfig::default().solve_timeout(),
            Some(Duration::from_secs(900))
        );
    }
}
