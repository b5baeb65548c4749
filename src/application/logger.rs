//! Injected logging dependency.
//!
//! Components emit events through `tracing` macros, but they do so inside the
//! dispatch they were constructed with rather than whatever subscriber happens
//! to be global when the event fires. Tests hand each component its own
//! capturing subscriber; production code usually just takes the default.

use std::future::Future;
use tracing::instrument::{Instrument, WithDispatch, WithSubscriber};
use tracing::{dispatcher, Dispatch};

/// A handle to the subscriber a component logs to.
///
/// # Example
/// ```
/// use serve_throttle::Logger;
///
/// // Captures whatever subscriber is the default right now
/// let logger = Logger::current();
/// logger.in_scope(|| tracing::info!("hello"));
/// ```
#[derive(Clone, Debug)]
pub struct Logger {
    dispatch: Dispatch,
}

impl Logger {
    /// Log to the given dispatch.
    pub fn new(dispatch: Dispatch) -> Self {
        Self { dispatch }
    }

    /// Log to the subscriber that is the default at the point of the call.
    pub fn current() -> Self {
        Self {
            dispatch: dispatcher::get_default(Dispatch::clone),
        }
    }

    /// Discard every event.
    pub fn none() -> Self {
        Self {
            dispatch: Dispatch::none(),
        }
    }

    /// Run `f` with this logger's dispatch as the default.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        dispatcher::with_default(&self.dispatch, f)
    }

    /// Make `future` log to this logger's dispatch every time it is polled.
    pub fn attach<F: Future>(&self, future: F) -> WithDispatch<F> {
        future.with_subscriber(self.dispatch.clone())
    }

    /// Attach both this logger and a span to `future`.
    pub fn attach_in<F: Future>(
        &self,
        span: tracing::Span,
        future: F,
    ) -> WithDispatch<tracing::instrument::Instrumented<F>> {
        future.instrument(span).with_subscriber(self.dispatch.clone())
    }

    /// The underlying dispatch.
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::current()
    }
}

impl<S> From<S> for Logger
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    fn from(subscriber: S) -> Self {
        Self::new(Dispatch::new(subscriber))
    }
}
