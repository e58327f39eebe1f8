//! `codeloop`: answer a task by generating, running and verifying a program.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use codeloop::core::extract::extract_program;
use codeloop::core::outcome::classify_outcome;
use codeloop::core::types::Outcome;
use codeloop::exit_codes;
use codeloop::io::attempt_log::{AttemptLog, new_run_id};
use codeloop::io::config::{
    CONFIG_FILE_NAME, GeneratorConfig, SolverConfig, load_config, write_config,
};
use codeloop::io::generator;
use codeloop::io::installer::CommandInstaller;
use codeloop::io::prompt::PromptBuilder;
use codeloop::io::sandbox::{ProcessSandbox, Sandbox};
use codeloop::logging;
use codeloop::solve::{SolveOptions, Solver, refine_task};

#[derive(Parser)]
#[command(
    name = "codeloop",
    version,
    about = "Answer tasks by generating, running and verifying programs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `codeloop.toml`.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
        #[arg(long, default_value = CONFIG_FILE_NAME)]
        config: PathBuf,
    },
    /// Solve a task and print `{"ok": ...}` or `{"error": ..., "attempts": n}`.
    Solve {
        /// Task text. Use `-` to read it from stdin.
        task: Option<String>,
        /// Read the task from a file instead.
        #[arg(long, conflicts_with = "task")]
        task_file: Option<PathBuf>,
        #[arg(long, default_value = CONFIG_FILE_NAME)]
        config: PathBuf,
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Rewrite the request into a precise task first.
        #[arg(long)]
        refine: bool,
        /// Write per-attempt prompts, programs and outcomes under this directory.
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },
    /// Extract `{program, dependencies}` from a model response on stdin.
    Extract,
    /// Run a program in the sandbox and print its classified outcome.
    Exec {
        file: PathBuf,
        #[arg(long, default_value = CONFIG_FILE_NAME)]
        config: PathBuf,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force, config } => cmd_init(&config, force),
        Command::Solve {
            task,
            task_file,
            config,
            max_attempts,
            refine,
            artifacts,
        } => {
            let task = read_task(task, task_file.as_deref())?;
            let mut cfg = load_config(&config)?;
            if let Some(max_attempts) = max_attempts {
                cfg.max_attempts = max_attempts;
            }
            cfg.refine_task |= refine;
            cfg.validate()?;
            cmd_solve(&cfg, &task, artifacts.as_deref())
        }
        Command::Extract => cmd_extract(),
        Command::Exec {
            file,
            config,
            timeout_secs,
        } => {
            let mut cfg = load_config(&config)?;
            if let Some(timeout_secs) = timeout_secs {
                cfg.exec_timeout_secs = timeout_secs;
            }
            cfg.validate()?;
            cmd_exec(&cfg, &file)
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &SolverConfig::default())?;
    info!(path = %path.display(), "wrote default config");
    Ok(exit_codes::OK)
}

fn read_task(task: Option<String>, task_file: Option<&Path>) -> Result<String> {
    let raw = match (task, task_file) {
        (_, Some(path)) => {
            fs::read_to_string(path).with_context(|| format!("read task {}", path.display()))?
        }
        (Some(task), None) if task == "-" => read_stdin()?,
        (Some(task), None) => task,
        (None, None) => bail!("missing task: pass TASK, `-` for stdin, or --task-file"),
    };
    let task = raw.trim().to_string();
    if task.is_empty() {
        bail!("task is empty");
    }
    Ok(task)
}

fn cmd_solve(cfg: &SolverConfig, task: &str, artifacts: Option<&Path>) -> Result<i32> {
    let api_key = match &cfg.generator {
        GeneratorConfig::Gemini(settings) => std::env::var(&settings.api_key_env).ok(),
        GeneratorConfig::Command(_) => None,
    };
    let generator = generator::from_config(&cfg.generator, api_key)?;
    let installer = CommandInstaller::from_config(&cfg.installer);
    let sandbox = ProcessSandbox::from_config(&cfg.sandbox, cfg.output_limit_bytes);
    let prompts = PromptBuilder::new(cfg.feedback_budget_bytes)?;
    let cancel = CancellationToken::new();

    let task = if cfg.refine_task {
        refine_task(&generator, &prompts, task, &cancel)?
    } else {
        task.to_string()
    };
    debug!(task = %task, "solving");

    let mut solver = Solver::new(
        generator,
        installer,
        sandbox,
        prompts,
        SolveOptions::from_config(cfg),
    );
    if let Some(dir) = artifacts {
        let log = AttemptLog::create(dir, &new_run_id(), &cfg.sandbox.file_suffix)?;
        eprintln!("artifacts: {}", log.run_dir().display());
        solver = solver.with_artifacts(log);
    }

    let result = solver.solve(&task, &cancel);
    print_json(&result.to_caller_json())?;
    Ok(exit_codes::for_result(&result))
}

fn cmd_extract() -> Result<i32> {
    let raw = read_stdin()?;
    let program = extract_program(&raw);
    print_json(&program)?;
    if program.is_empty() {
        return Ok(exit_codes::GENERATION);
    }
    Ok(exit_codes::OK)
}

#[derive(Serialize)]
struct ExecReport<'a> {
    outcome: &'a Outcome,
    exit_code: Option<i32>,
    timed_out: bool,
    duration_ms: u64,
}

fn cmd_exec(cfg: &SolverConfig, file: &Path) -> Result<i32> {
    let source =
        fs::read_to_string(file).with_context(|| format!("read program {}", file.display()))?;
    let sandbox = ProcessSandbox::from_config(&cfg.sandbox, cfg.output_limit_bytes);
    if let Some(diagnostic) = sandbox.check_syntax(&source) {
        eprintln!("syntax check failed:\n{diagnostic}");
    }
    let result = sandbox.run(
        &source,
        Duration::from_secs(cfg.exec_timeout_secs),
        &CancellationToken::new(),
    )?;
    let outcome = classify_outcome(&result);
    print_json(&ExecReport {
        outcome: &outcome,
        exit_code: result.exit_code,
        timed_out: result.timed_out,
        duration_ms: result.duration.as_millis() as u64,
    })?;
    if outcome.is_success() {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::EXHAUSTED)
    }
}

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("read stdin")?;
    Ok(buf)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{payload}").context("write stdout")?;
    Ok(())
}
