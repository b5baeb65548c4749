//! Clock adapters for time operations.
//!
//! [`SystemClock`] reads tokio's clock, so bucket refills and idle eviction
//! follow `tokio::time::pause`/`advance` in tests the same way the sweeper's
//! interval does. Outside a paused runtime it is plain monotonic time.
//!
//! See `MockClock` (in `crate::infrastructure::mocks`) for a clock that only
//! moves when told to.

use crate::application::ports::Clock;
use std::time::Instant;

/// System clock implementation backed by `tokio::time::Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}
