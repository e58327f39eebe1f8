//! Stderr tracing for the `codeloop` and `eval` binaries.
//!
//! Attempts, installs, sandbox kills and retry decisions are emitted as
//! `tracing` events with structured fields. stdout carries only the JSON
//! result, so every event goes to stderr.
//!
//! Attempt artifacts written by `solve --artifacts DIR` are product output and
//! do not depend on the filter set here.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Directive used when `RUST_LOG` is unset or invalid.
const DEFAULT_DIRECTIVE: &str = "warn";

/// Install the stderr subscriber. Safe to call more than once.
///
/// ```bash
/// RUST_LOG=codeloop=debug codeloop solve "What is 2+2?"
/// ```
pub fn init() {
    // A harness embedding the solver may already have installed a subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}
