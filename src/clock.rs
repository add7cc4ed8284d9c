//! Monotonic millisecond clock.
//!
//! Every duration in the runtime (connection timeouts, upstream budgets, rate
//! windows) is measured against this clock so wall-clock adjustments cannot
//! move deadlines. The epoch is the first call in the process.

use once_cell::sync::Lazy;
use std::time::Instant;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since the process-wide epoch. Never decreases.
pub fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}
