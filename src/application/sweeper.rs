//! Periodic eviction of idle clients.
//!
//! One long-lived tokio task calls [`RateLimiterStore::sweep`] on a fixed
//! interval. A sweep that panics is logged and counted, and the next tick runs
//! as usual: a bad pass never takes the limiter down with it.

use crate::application::ports::Storage;
use crate::application::store::RateLimiterStore;
use crate::application::tracker::panic_message;
use crate::domain::client::{ClientEntry, ClientId};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Error returned when sweep configuration is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SweepConfigError {
    /// Sweep interval was zero
    #[error("sweep interval must be greater than 0")]
    ZeroInterval,
    /// Idle threshold was zero
    #[error("idle threshold must be greater than 0")]
    ZeroIdleThreshold,
}

/// Error returned when the sweeper task cannot be stopped cleanly.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// The sweeper task panicked or was cancelled
    #[error("sweeper task failed: {0}")]
    TaskFailed(#[from] JoinError),
}

/// Configuration for the eviction sweeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    /// Time between sweeps. The first sweep runs one interval after start.
    pub interval: Duration,
    /// Entries not seen for longer than this are evicted.
    pub idle_threshold: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            idle_threshold: Duration::from_secs(180),
        }
    }
}

impl SweepConfig {
    /// Create a sweep configuration.
    ///
    /// # Errors
    /// Returns an error if either duration is zero.
    pub fn new(interval: Duration, idle_threshold: Duration) -> Result<Self, SweepConfigError> {
        if interval.is_zero() {
            return Err(SweepConfigError::ZeroInterval);
        }
        if idle_threshold.is_zero() {
            return Err(SweepConfigError::ZeroIdleThreshold);
        }
        Ok(Self {
            interval,
            idle_threshold,
        })
    }
}

/// Drives periodic sweeps of a [`RateLimiterStore`].
#[derive(Debug)]
pub struct EvictionSweeper<S>
where
    S: Storage<ClientId, ClientEntry>,
{
    store: RateLimiterStore<S>,
    config: SweepConfig,
}

impl<S> EvictionSweeper<S>
where
    S: Storage<ClientId, ClientEntry>,
{
    /// Create a sweeper for `store`.
    pub fn new(store: RateLimiterStore<S>, config: SweepConfig) -> Self {
        Self { store, config }
    }

    /// Run one sweep, isolating a panic.
    ///
    /// Returns the number of evicted entries, or `None` if the pass panicked.
    pub fn run_once(&self) -> Option<usize> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.store.sweep(self.config.idle_threshold)
        }));

        match outcome {
            Ok(evicted) => Some(evicted),
            Err(payload) => {
                self.store.metrics().record_sweep_failure();
                self.store.logger().in_scope(|| {
                    tracing::error!(
                        error = %panic_message(payload.as_ref()),
                        "eviction sweep failed"
                    );
                });
                None
            }
        }
    }

    /// The sweep configuration.
    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Start sweeping on the current tokio runtime.
    ///
    /// The task runs until [`SweeperHandle::shutdown`] is called, or until the
    /// runtime stops if the handle is dropped.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn start(self) -> SweeperHandle
    where
        S: Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let period = self.config.interval;
        let logger = self.store.logger().clone();

        let task = async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut detached = false;

            loop {
                tokio::select! {
                    biased;
                    signal = &mut shutdown_rx, if !detached => match signal {
                        Ok(()) => break,
                        // Handle dropped without shutdown: keep sweeping
                        Err(_) => detached = true,
                    },
                    _ = ticker.tick() => {
                        self.run_once();
                    }
                }
            }
        };

        SweeperHandle {
            shutdown_tx,
            join: tokio::spawn(logger.attach(task)),
        }
    }
}

impl<S> RateLimiterStore<S>
where
    S: Storage<ClientId, ClientEntry> + Clone + Send + 'static,
{
    /// Start a background task sweeping this store on `config.interval`.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn spawn_sweeper(&self, config: SweepConfig) -> SweeperHandle {
        EvictionSweeper::new(self.clone(), config).start()
    }
}

/// Handle to a running sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for its task to finish.
    ///
    /// A sweep in progress completes first.
    pub async fn shutdown(self) -> Result<(), ShutdownError> {
        // The task may already be gone; the join below reports why.
        let _ = self.shutdown_tx.send(());
        self.join.await?;
        Ok(())
    }

    /// Whether the sweeper task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
