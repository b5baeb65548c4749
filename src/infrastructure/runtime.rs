//! Service lifecycle: listen, serve, drain on signal, join background work.
//!
//! ```text
//! Starting --bind ok--> Serving --signal/trigger--> Draining --drained + joined--> Terminated
//!     \--bind fails--------------------------------------------------------------> Terminated
//!                       Serving --fatal accept error-------------------------------> Terminated
//! ```

use crate::application::logger::Logger;
use crate::application::tracker::TaskTracker;
use crate::config::{ConfigError, ServerConfig};
use crate::infrastructure::connection::IdleTimeout;
use crate::infrastructure::signal::{ShutdownHandle, SignalListener};
use axum::extract::ConnectInfo;
use axum::http::Request;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use std::fmt::Display;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tower::ServiceExt;
use tower_http::timeout::TimeoutLayer;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Where a [`ServiceRuntime`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Created, not yet listening
    Starting,
    /// Accepting connections
    Serving,
    /// Listener closed, in-flight connections finishing
    Draining,
    /// Stopped; `run` has returned or is about to
    Terminated,
}

/// Connection draining did not finish cleanly.
#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    /// Connections were still open when the grace period ran out and were aborted
    #[error("shutdown grace period of {grace:?} elapsed with {remaining} connection(s) still open")]
    GraceElapsed { grace: Duration, remaining: usize },
    /// A connection task panicked while draining
    #[error("connection task failed: {0}")]
    ConnectionTask(#[from] JoinError),
}

/// Why [`ServiceRuntime::run`] failed.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// SIGINT/SIGTERM handlers could not be installed
    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] io::Error),
    /// The listener could not be bound
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    /// The listener failed with a non-transient error
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
    /// Shutdown completed but draining did not
    #[error(transparent)]
    Drain(#[from] DrainError),
    /// `run` was called more than once
    #[error("service runtime has already been started")]
    AlreadyStarted,
}

/// Owns the listener, the in-flight connections and the background tracker.
///
/// # Example
/// ```no_run
/// use axum::{routing::get, Router};
/// use serve_throttle::config::ServerConfig;
/// use serve_throttle::ServiceRuntime;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let router = Router::new().route("/", get(|| async { "hello" }));
/// let runtime = ServiceRuntime::builder(router)
///     .config(ServerConfig::with_address("127.0.0.1:4000"))
///     .build()?;
///
/// // Returns after SIGINT/SIGTERM, once connections and background work are done
/// runtime.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ServiceRuntime {
    config: ServerConfig,
    router: Router,
    tracker: TaskTracker,
    shutdown: ShutdownHandle,
    state: watch::Sender<LifecycleState>,
    started: AtomicBool,
    local_addr: OnceLock<SocketAddr>,
    logger: Logger,
}

/// Builder for [`ServiceRuntime`].
#[derive(Debug)]
pub struct ServiceRuntimeBuilder {
    config: ServerConfig,
    router: Router,
    tracker: Option<TaskTracker>,
    shutdown: Option<ShutdownHandle>,
    logger: Option<Logger>,
}

impl ServiceRuntimeBuilder {
    /// Listener and timeout settings. Defaults to [`ServerConfig::default`].
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing tracker, e.g. one handlers already hold clones of.
    pub fn tracker(mut self, tracker: TaskTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Share an existing shutdown handle.
    pub fn shutdown_handle(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Log lifecycle events to `logger` instead of the current default subscriber.
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Validate the configuration and create the runtime.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` for an empty address or a zero duration.
    pub fn build(self) -> Result<ServiceRuntime, ConfigError> {
        self.config.validate()?;

        let logger = self.logger.unwrap_or_else(Logger::current);
        let tracker = self
            .tracker
            .unwrap_or_else(|| TaskTracker::with_logger(logger.clone()));
        let (state, _) = watch::channel(LifecycleState::Starting);

        Ok(ServiceRuntime {
            config: self.config,
            router: self.router,
            tracker,
            shutdown: self.shutdown.unwrap_or_default(),
            state,
            started: AtomicBool::new(false),
            local_addr: OnceLock::new(),
            logger,
        })
    }
}

impl ServiceRuntime {
    /// Start building a runtime serving `router`.
    pub fn builder(router: Router) -> ServiceRuntimeBuilder {
        ServiceRuntimeBuilder {
            config: ServerConfig::default(),
            router,
            tracker: None,
            shutdown: None,
            logger: None,
        }
    }

    /// Serve until a termination signal or [`ShutdownHandle::trigger`], then drain.
    ///
    /// Connections get at most `shutdown_grace` to finish; background work is
    /// then joined with no timeout. Returns exactly once.
    ///
    /// # Errors
    /// - `Signal` / `Bind`: nothing was served
    /// - `Accept`: the listener failed while serving. Running out of file
    ///   descriptors is not fatal; accepting backs off and resumes.
    /// - `Drain`: connections had to be aborted; background work was still joined
    /// - `AlreadyStarted`: a previous call owns the lifecycle
    pub async fn run(&self) -> Result<(), ServeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServeError::AlreadyStarted);
        }
        self.logger.attach(self.serve()).await
    }

    /// Run `work` in the background, tracked for shutdown.
    ///
    /// Errors and panics are logged, never returned.
    pub fn background<F, E>(&self, work: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.tracker.spawn(work);
    }

    /// The background task tracker. Clones can be handed to handlers.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// A handle that starts shutdown as if a signal had arrived.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle transitions.
    pub fn lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// The bound address, once serving. Useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.send_replace(state);
    }

    async fn serve(&self) -> Result<(), ServeError> {
        let signals = match SignalListener::install() {
            Ok(signals) => signals,
            Err(err) => {
                self.set_state(LifecycleState::Terminated);
                return Err(ServeError::Signal(err));
            }
        };

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(err) => {
                self.set_state(LifecycleState::Terminated);
                return Err(err);
            }
        };

        let signal_task = self.spawn_signal_task(signals);
        let app = self
            .router
            .clone()
            .layer(TimeoutLayer::new(self.config.write_timeout));
        let graceful = GracefulShutdown::new();
        let mut connections = JoinSet::new();

        tracing::info!(addr = %self.config.address, "starting server");
        self.set_state(LifecycleState::Serving);

        let accepted = self
            .accept_loop(&listener, &app, &graceful, &mut connections)
            .await;
        drop(listener);

        if let Err(err) = accepted {
            tracing::error!(error = %err, "listener failed");
            connections.shutdown().await;
            self.shutdown.trigger();
            signal_task.abort();
            self.set_state(LifecycleState::Terminated);
            return Err(err);
        }

        self.set_state(LifecycleState::Draining);
        tracing::info!(addr = %self.config.address, "shutting down server");
        let drained = self.drain(graceful, connections).await;

        tracing::info!(
            addr = %self.config.address,
            active = self.tracker.active_count(),
            "completing background tasks"
        );
        self.tracker.wait().await;

        signal_task.abort();
        self.set_state(LifecycleState::Terminated);
        tracing::info!(addr = %self.config.address, "server stopped");

        drained.map_err(ServeError::from)
    }

    async fn bind(&self) -> Result<TcpListener, ServeError> {
        let bind_error = |source| ServeError::Bind {
            address: self.config.address.clone(),
            source,
        };
        let listener = TcpListener::bind(&self.config.address)
            .await
            .map_err(bind_error)?;
        let addr = listener.local_addr().map_err(bind_error)?;
        // `run` executes once, so this is the only write.
        let _ = self.local_addr.set(addr);
        Ok(listener)
    }

    fn spawn_signal_task(&self, mut signals: SignalListener) -> JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(self.logger.attach(async move {
            tokio::select! {
                received = signals.recv() => match received {
                    Ok(signal) => {
                        tracing::info!(signal = %signal, "caught signal");
                        shutdown.trigger();
                    }
                    Err(err) => tracing::error!(error = %err, "signal listener failed"),
                },
                () = shutdown.triggered() => {}
            }
        }))
    }

    async fn accept_loop(
        &self,
        listener: &TcpListener,
        app: &Router,
        graceful: &GracefulShutdown,
        connections: &mut JoinSet<()>,
    ) -> Result<(), ServeError> {
        let builder = self.http_builder();
        let shutdown = self.shutdown.triggered();
        tokio::pin!(shutdown);
        let mut backoff: Option<Duration> = None;

        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        backoff = None;
                        self.spawn_connection(stream, remote_addr, app, &builder, graceful, connections);
                    }
                    Err(err) if is_transient(&err) => {
                        tracing::debug!(error = %err, "skipping failed accept");
                    }
                    Err(err) if is_resource_exhaustion(&err) => {
                        let delay = next_backoff(backoff);
                        backoff = Some(delay);
                        tracing::warn!(error = %err, retry_in = ?delay, "accept failed, backing off");
                        tokio::select! {
                            biased;
                            () = &mut shutdown => return Ok(()),
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(err) => return Err(ServeError::Accept(err)),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        tracing::error!(error = %err, "connection task failed");
                    }
                }
            }
        }
    }

    fn http_builder(&self) -> Builder<TokioExecutor> {
        let mut builder = Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.config.read_timeout);
        builder
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        app: &Router,
        builder: &Builder<TokioExecutor>,
        graceful: &GracefulShutdown,
        connections: &mut JoinSet<()>,
    ) {
        tracing::trace!(client = %remote_addr, "connection accepted");

        let service = app.clone().map_request(move |mut request: Request<Incoming>| {
            request.extensions_mut().insert(ConnectInfo(remote_addr));
            request
        });
        let hyper_service = TowerToHyperService::new(service);
        let io = TokioIo::new(IdleTimeout::new(stream, self.config.idle_timeout));
        let builder = builder.clone();
        let watcher = graceful.watcher();

        connections.spawn(self.logger.attach(async move {
            let conn = builder.serve_connection_with_upgrades(io, hyper_service);
            if let Err(err) = watcher.watch(conn).await {
                tracing::debug!(client = %remote_addr, error = %err, "connection closed with error");
            }
        }));
    }

    async fn drain(
        &self,
        graceful: GracefulShutdown,
        mut connections: JoinSet<()>,
    ) -> Result<(), DrainError> {
        let grace = self.config.shutdown_grace;

        let finished = tokio::time::timeout(grace, async {
            graceful.shutdown().await;
            let mut failure = None;
            while let Some(joined) = connections.join_next().await {
                if let Err(err) = joined {
                    tracing::error!(error = %err, "connection task failed");
                    failure.get_or_insert(err);
                }
            }
            failure
        })
        .await;

        match finished {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(DrainError::ConnectionTask(err)),
            Err(_) => {
                let remaining = connections.len();
                tracing::warn!(
                    grace_secs = grace.as_secs_f64(),
                    remaining,
                    "shutdown grace period elapsed, aborting open connections"
                );
                connections.shutdown().await;
                Err(DrainError::GraceElapsed { grace, remaining })
            }
        }
    }
}

/// Accept failures that say the process is out of descriptors or buffers.
/// The listener is still healthy and accepting resumes once some are freed.
fn is_resource_exhaustion(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::OutOfMemory || is_descriptor_exhaustion(err)
}

#[cfg(unix)]
fn is_descriptor_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_descriptor_exhaustion(_err: &io::Error) -> bool {
    false
}

/// Doubles from [`ACCEPT_BACKOFF_MIN`] up to [`ACCEPT_BACKOFF_MAX`].
fn next_backoff(previous: Option<Duration>) -> Duration {
    previous.map_or(ACCEPT_BACKOFF_MIN, |delay| {
        (delay * 2).min(ACCEPT_BACKOFF_MAX)
    })
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
    )
}
