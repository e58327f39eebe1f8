//! LLM-backed generate/execute/verify loop.
//!
//! A task is turned into a program by a model, the program's dependencies are
//! installed, and the program runs in a throwaway sandbox. Its output is
//! checked against a line-marker result protocol, and failures are fed back
//! into regeneration until an answer is produced or attempts run out. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (extraction, outcome
//!   classification, the retry state machine). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (processes, HTTP, installers, config,
//!   artifacts). Isolated behind traits to enable scripted collaborators in tests.
//!
//! [`solve`] coordinates core logic with I/O to implement the retry controller.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod solve;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
