//! Deterministic, pure logic shared by the solve loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (model text, captured output, session state) and return deterministic
//! results suitable for tests.

pub mod budget;
pub mod contract;
pub mod extract;
pub mod outcome;
pub mod session;
pub mod types;
