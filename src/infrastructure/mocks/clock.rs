//! Mock clock for testing.

use crate::application::ports::Clock;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A clock that only moves when told to.
///
/// Drives bucket refill and idle eviction deterministically. Clones share the
/// same time, so a test can keep one clone while the store holds another.
///
/// # Examples
///
/// ```ignore
/// use serve_throttle::infrastructure::mocks::MockClock;
/// use serve_throttle::{ClientId, Quota, RateLimiterStore};
/// use serve_throttle::infrastructure::storage::LockedStorage;
/// use std::sync::Arc;
/// use std::time::{Duration, Instant};
///
/// let clock = MockClock::new(Instant::now());
/// let store = RateLimiterStore::with_parts(
///     Arc::new(LockedStorage::new()),
///     Arc::new(clock.clone()),
///     Some(Quota::new(1.0, 1).unwrap()),
/// );
/// let client = ClientId::from("192.0.2.1");
///
/// assert!(store.check(&client).is_allowed());
/// assert!(store.check(&client).is_denied());
///
/// clock.advance(Duration::from_secs(1));
/// assert!(store.check(&client).is_allowed());
/// ```
#[derive(Debug, Clone)]
pub struct MockClock {
    current_time: Arc<Mutex<Instant>>,
}

impl MockClock {
    /// Create a mock clock starting at a specific instant.
    pub fn new(start: Instant) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(start)),
        }
    }

    fn time(&self) -> MutexGuard<'_, Instant> {
        self.current_time
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock")
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        *self.time() += duration;
    }

    /// Set the clock to a specific instant.
    pub fn set(&self, instant: Instant) {
        *self.time() = instant;
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.time()
    }
}
