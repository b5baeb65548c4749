//! Per-client rate limiter store.
//!
//! Maps each [`ClientId`] to a [`ClientEntry`] holding its token bucket. Buckets
//! refill lazily when checked; idle entries are reclaimed by [`sweep`], usually
//! driven by the [`EvictionSweeper`](crate::application::sweeper::EvictionSweeper).
//!
//! [`sweep`]: RateLimiterStore::sweep

use crate::application::{logger::Logger, metrics::Metrics, ports::Clock, ports::Storage};
use crate::domain::bucket::{Decision, Quota};
use crate::domain::client::{ClientEntry, ClientId};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::storage::LockedStorage;
use std::sync::Arc;
use std::time::Duration;

/// Default storage: one map behind one lock, shared by the store's clones.
pub type DefaultStorage = Arc<LockedStorage<ClientId, ClientEntry>>;

/// Registry of token buckets keyed by client.
///
/// Cloning is cheap and clones share state, which is how the HTTP middleware
/// and the sweeper task see the same buckets.
///
/// # Example
/// ```
/// use serve_throttle::{ClientId, Quota, RateLimiterStore};
///
/// let store = RateLimiterStore::new(Quota::new(2.0, 4).unwrap());
/// let client = ClientId::from("203.0.113.7");
///
/// for _ in 0..4 {
///     assert!(store.check(&client).is_allowed());
/// }
/// assert!(store.check(&client).is_denied());
/// ```
#[derive(Debug, Clone)]
pub struct RateLimiterStore<S = DefaultStorage>
where
    S: Storage<ClientId, ClientEntry>,
{
    storage: S,
    clock: Arc<dyn Clock>,
    quota: Option<Quota>,
    metrics: Metrics,
    logger: Logger,
}

impl RateLimiterStore<DefaultStorage> {
    /// Create an enabled store using the system clock and default storage.
    pub fn new(quota: Quota) -> Self {
        Self::with_parts(
            Arc::new(LockedStorage::new()),
            Arc::new(SystemClock::new()),
            Some(quota),
        )
    }

    /// Create a store that admits everything and keeps no state.
    pub fn disabled() -> Self {
        Self::with_parts(
            Arc::new(LockedStorage::new()),
            Arc::new(SystemClock::new()),
            None,
        )
    }
}

impl<S> RateLimiterStore<S>
where
    S: Storage<ClientId, ClientEntry>,
{
    /// Create a store from explicit parts. `None` disables limiting.
    pub fn with_parts(storage: S, clock: Arc<dyn Clock>, quota: Option<Quota>) -> Self {
        Self {
            storage,
            clock,
            quota,
            metrics: Metrics::new(),
            logger: Logger::current(),
        }
    }

    /// Replace the logger used for sweep events.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Decide whether `client` may make one more request now.
    ///
    /// A disabled store always allows and records nothing. Otherwise the entry
    /// is created with a full bucket on first sight, refilled, and charged one
    /// token, all inside a single storage critical section.
    pub fn check(&self, client: &ClientId) -> Decision {
        let Some(quota) = self.quota else {
            return Decision::Allowed;
        };

        let now = self.clock.now();
        let decision = self.storage.with_entry_mut(
            client.clone(),
            || ClientEntry::new(quota, now),
            |entry| entry.check(now),
        );

        match decision {
            Decision::Allowed => self.metrics.record_allowed(),
            Decision::Denied => self.metrics.record_denied(),
        }
        decision
    }

    /// Remove every entry idle for longer than `idle_threshold`.
    ///
    /// Returns the number of entries removed. One pass holds the storage lock
    /// (per shard, for sharded storage) and does constant work per entry.
    pub fn sweep(&self, idle_threshold: Duration) -> usize {
        let now = self.clock.now();
        let mut evicted = 0;

        self.storage.retain(|_, entry| {
            let idle = entry.is_idle(now, idle_threshold);
            if idle {
                evicted += 1;
            }
            !idle
        });

        if evicted > 0 {
            self.metrics.record_evictions(evicted);
            self.logger.in_scope(|| {
                tracing::debug!(evicted, remaining = self.storage.len(), "evicted idle clients");
            });
        }
        evicted
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Whether no clients are tracked.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Whether `client` currently has an entry.
    pub fn contains(&self, client: &ClientId) -> bool {
        self.storage.contains_key(client)
    }

    /// Tokens `client` would have available right now, if it has an entry.
    pub fn tokens(&self, client: &ClientId) -> Option<f64> {
        let now = self.clock.now();
        self.storage
            .with_entry(client, |entry| entry.bucket.available_at(now))
    }

    /// The quota applied to new clients, or `None` when disabled.
    pub fn quota(&self) -> Option<Quota> {
        self.quota
    }

    /// Whether requests are being limited at all.
    pub fn is_enabled(&self) -> bool {
        self.quota.is_some()
    }

    /// Counters for this store and its clones.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.logger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::MockClock;
    use crate::infrastructure::storage::ShardedStorage;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    fn store_at(rps: f64, burst: u32) -> (RateLimiterStore, MockClock) {
        let clock = MockClock::new(Instant::now());
        let store = RateLimiterStore::with_parts(
            Arc::new(LockedStorage::new()),
            Arc::new(clock.clone()),
            Some(Quota::new(rps, burst).unwrap()),
        )
        .with_logger(Logger::none());
        (store, clock)
    }

    #[test]
    fn test_burst_then_refill() {
        let (store, clock) = store_at(2.0, 4);
        let client = ClientId::from("10.0.0.1");

        for _ in 0..4 {
            assert_eq!(store.check(&client), Decision::Allowed);
        }
        assert_eq!(store.check(&client), Decision::Denied);

        clock.advance(Duration::from_millis(500));
        assert_eq!(store.check(&client), Decision::Allowed);
        assert_eq!(store.check(&client), Decision::Denied);

        let snapshot = store.metrics().snapshot();
        assert_eq!(snapshot.requests_allowed, 5);
        assert_eq!(snapshot.requests_denied, 2);
    }

    #[test]
    fn test_disabled_store_allows_everything_and_keeps_nothing() {
        let store = RateLimiterStore::disabled();
        let client = ClientId::from("10.0.0.1");

        for _ in 0..10_000 {
            assert!(store.check(&client).is_allowed());
        }

        assert!(!store.is_enabled());
        assert!(store.is_empty());
        assert_eq!(store.metrics().requests_allowed(), 0);
    }

    #[test]
    fn test_clients_are_isolated() {
        let (store, _clock) = store_at(1.0, 2);
        let a = ClientId::from("10.0.0.1");
        let b = ClientId::from("10.0.0.2");

        assert!(store.check(&a).is_allowed());
        assert!(store.check(&a).is_allowed());
        assert!(store.check(&a).is_denied());

        assert!(store.check(&b).is_allowed());
        assert_eq!(store.tokens(&b), Some(1.0));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_concurrent_first_sight_creates_one_entry() {
        let (store, _clock) = store_at(0.001, 1);
        let store = Arc::new(store);
        let client = ClientId::from("10.0.0.9");
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                let client = client.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store.check(&client)
                })
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Decision::is_allowed)
            .count();

        assert_eq!(allowed, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_sweep_evicts_only_idle_entries() {
        let (store, clock) = store_at(1.0, 1);
        let stale = ClientId::from("10.0.0.1");
        let fresh = ClientId::from("10.0.0.2");

        store.check(&stale);
        clock.advance(Duration::from_secs(150));
        store.check(&fresh);
        clock.advance(Duration::from_secs(50));

        assert_eq!(store.sweep(Duration::from_secs(180)), 1);
        assert!(!store.contains(&stale));
        assert!(store.contains(&fresh));
        assert_eq!(store.metrics().clients_evicted(), 1);
    }

    #[test]
    fn test_denied_checks_keep_entry_alive() {
        let (store, clock) = store_at(0.001, 1);
        let client = ClientId::from("10.0.0.1");

        store.check(&client);
        clock.advance(Duration::from_secs(100));
        assert!(store.check(&client).is_denied());
        clock.advance(Duration::from_secs(100));

        assert_eq!(store.sweep(Duration::from_secs(180)), 0);
        assert!(store.contains(&client));
    }

    #[test]
    fn test_evicted_client_returns_with_full_bucket() {
        let (store, clock) = store_at(0.01, 3);
        let client = ClientId::from("10.0.0.1");

        for _ in 0..3 {
            store.check(&client);
        }
        clock.advance(Duration::from_secs(181));
        assert_eq!(store.sweep(Duration::from_secs(180)), 1);

        for _ in 0..3 {
            assert!(store.check(&client).is_allowed());
        }
        assert!(store.check(&client).is_denied());
    }

    #[test]
    fn test_sharded_storage_behaves_the_same() {
        let clock = MockClock::new(Instant::now());
        let store = RateLimiterStore::with_parts(
            Arc::new(ShardedStorage::<ClientId, ClientEntry>::new()),
            Arc::new(clock.clone()),
            Some(Quota::new(1.0, 1).unwrap()),
        )
        .with_logger(Logger::none());
        let client = ClientId::from("10.0.0.1");

        assert!(store.check(&client).is_allowed());
        assert!(store.check(&client).is_denied());
        clock.advance(Duration::from_secs(1));
        assert!(store.check(&client).is_allowed());
    }

    #[test]
    fn test_clones_share_buckets() {
        let (store, _clock) = store_at(1.0, 1);
        let clone = store.clone();
        let client = ClientId::from("10.0.0.1");

        assert!(store.check(&client).is_allowed());
        assert!(clone.check(&client).is_denied());
        assert_eq!(clone.metrics().requests_denied(), 1);
    }
}
