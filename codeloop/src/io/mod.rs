//! Side-effecting adapters: processes, model backends, installers and artifacts.

pub mod attempt_log;
pub mod config;
pub mod gemini;
pub mod generator;
pub mod installer;
pub mod process;
pub mod prompt;
pub mod sandbox;
