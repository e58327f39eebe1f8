//! Deadline helpers shared by the solve loop.

use std::time::{Duration, Instant};

/// Time left until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
}

/// Clamp a per-step timeout to whatever remains of the overall budget.
pub fn step_timeout(configured: Duration, deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        Some(deadline) => remaining_budget(deadline).map(|remaining| remaining.min(configured)),
        None => Some(configured),
    }
}
