//! Counted detached work.
//!
//! A [`TaskTracker`] runs fire-and-forget units of work and lets shutdown wait
//! for all of them. Each unit is isolated: an `Err` or a panic is logged and
//! counted, never propagated to the caller or the process.

use crate::application::logger::Logger;
use futures::FutureExt;
use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Tracks detached background work.
///
/// Clones share the same counter, so a handler can hold a clone while the
/// runtime waits on the original.
///
/// # Example
/// ```
/// use serve_throttle::TaskTracker;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let tracker = TaskTracker::new();
/// tracker.spawn(async { Ok::<_, std::io::Error>(()) });
/// tracker.spawn(async { Err::<(), _>("boom") });
///
/// // Resolves once both have finished, failed or not
/// tracker.wait().await;
/// assert_eq!(tracker.failed_count(), 1);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TaskTracker {
    inner: Arc<Inner>,
    logger: Logger,
}

#[derive(Debug, Default)]
struct Inner {
    active: Mutex<usize>,
    idle: Notify,
    spawned: AtomicU64,
    failed: AtomicU64,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report<E: Display>(&self, outcome: Result<Result<(), E>, Box<dyn Any + Send>>) {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %err, "background task failed");
            }
            Err(payload) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let err = panic_message(payload.as_ref());
                tracing::error!(error = %err, "background task failed");
            }
        }
    }
}

/// Marks one unit of tracked work as in flight until dropped.
///
/// Dropping the guard is the only way the active count goes down, so the
/// count stays correct when the work panics or its task is cancelled.
#[derive(Debug)]
#[must_use = "the work is considered finished as soon as the guard is dropped"]
pub struct TaskGuard {
    inner: Arc<Inner>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let mut active = self.inner.active();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl TaskTracker {
    /// Create a tracker logging to the current default subscriber.
    pub fn new() -> Self {
        Self::with_logger(Logger::current())
    }

    /// Create a tracker logging to `logger`.
    pub fn with_logger(logger: Logger) -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            logger,
        }
    }

    /// Count one unit of work as active until the returned guard is dropped.
    pub fn enter(&self) -> TaskGuard {
        *self.inner.active() += 1;
        self.inner.spawned.fetch_add(1, Ordering::Relaxed);
        TaskGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Run `work` on the tokio runtime without awaiting it.
    ///
    /// The work is counted before this returns. Its error or panic is logged
    /// at ERROR level and counted in [`failed_count`](Self::failed_count).
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn spawn<F, E>(&self, work: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let guard = self.enter();
        let inner = Arc::clone(&self.inner);
        let task = async move {
            let outcome = AssertUnwindSafe(work).catch_unwind().await;
            inner.report(outcome);
            drop(guard);
        };
        tokio::spawn(self.logger.attach(task));
    }

    /// Run a synchronous closure on tokio's blocking pool without awaiting it.
    ///
    /// Same accounting and isolation as [`spawn`](Self::spawn).
    pub fn spawn_blocking<F, E>(&self, work: F)
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Display + Send + 'static,
    {
        let guard = self.enter();
        let inner = Arc::clone(&self.inner);
        let logger = self.logger.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(work));
            logger.in_scope(|| inner.report(outcome));
            drop(guard);
        });
    }

    /// Wait until no tracked work is active.
    ///
    /// Work spawned before this observes an empty tracker is always included.
    /// There is no timeout.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before reading the count so a concurrent drop to zero
            // cannot slip between the check and the await.
            notified.as_mut().enable();

            if *self.inner.active() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Number of units currently in flight.
    pub fn active_count(&self) -> usize {
        *self.inner.active()
    }

    /// Number of units ever started, including manual [`enter`](Self::enter) calls.
    pub fn spawned_count(&self) -> u64 {
        self.inner.spawned.load(Ordering::Relaxed)
    }

    /// Number of units that returned an error or panicked.
    pub fn failed_count(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::MockCaptureLayer;
    use std::time::Duration;
    use tracing::Level;
    use tracing_subscriber::layer::SubscriberExt;

    fn capturing_tracker() -> (TaskTracker, MockCaptureLayer) {
        let capture = MockCaptureLayer::new();
        let logger = Logger::from(tracing_subscriber::registry().with(capture.clone()));
        (TaskTracker::with_logger(logger), capture)
    }

    #[tokio::test]
    async fn test_wait_on_empty_tracker_returns_immediately() {
        let tracker = TaskTracker::with_logger(Logger::none());
        tokio::time::timeout(Duration::from_secs(1), tracker.wait())
            .await
            .expect("wait should not block");
    }

    async fn explode() -> Result<(), String> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        panic!("handler exploded")
    }

    #[tokio::test]
    async fn test_wait_covers_failing_work() {
        let (tracker, capture) = capturing_tracker();

        tracker.spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, String>(())
        });
        tracker.spawn(async { Err::<(), _>("disk full".to_string()) });
        tracker.spawn(explode());
        assert_eq!(tracker.spawned_count(), 3);

        tracker.wait().await;

        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.failed_count(), 2);

        let events = capture.get_captured();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.level == Level::ERROR && e.message == "background task failed"));
    }

    #[tokio::test]
    async fn test_wait_blocks_until_guard_dropped() {
        let tracker = TaskTracker::with_logger(Logger::none());
        let guard = tracker.enter();

        let pending = tokio::time::timeout(Duration::from_millis(50), tracker.wait()).await;
        assert!(pending.is_err());

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait().await })
        };
        tokio::task::yield_now().await;
        drop(guard);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should resolve after the guard is dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_includes_work_spawned_while_waiting() {
        use std::sync::atomic::AtomicBool;

        let tracker = TaskTracker::with_logger(Logger::none());
        let guard = tracker.enter();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let finished = Arc::new(AtomicBool::new(false));
        {
            let finished = Arc::clone(&finished);
            tracker.spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                finished.store(true, Ordering::SeqCst);
                Ok::<_, String>(())
            });
        }
        drop(guard);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());
        assert_eq!(tracker.active_count(), 1);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should resolve once the late task finishes")
            .unwrap();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn test_panic_is_logged_with_error_field_only() {
        let (tracker, capture) = capturing_tracker();

        tracker.spawn(explode());
        tracker.wait().await;

        let events = capture.get_captured();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].field("error"), Some("handler exploded"));
        assert_eq!(events[0].fields.len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_blocking_isolates_errors() {
        let (tracker, capture) = capturing_tracker();

        tracker.spawn_blocking(|| Err::<(), _>("bad input"));
        tracker.spawn_blocking(|| Ok::<_, &str>(()));
        tracker.wait().await;

        assert_eq!(tracker.failed_count(), 1);
        assert_eq!(capture.count(), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
