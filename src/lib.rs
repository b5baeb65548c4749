//! # serve-throttle
//!
//! Graceful lifecycle management and per-client rate limiting for tokio/axum HTTP services.
//!
//! The crate has two halves that are usually used together:
//!
//! - [`ServiceRuntime`] binds a listener, serves an axum [`Router`](axum::Router), and on
//!   SIGINT/SIGTERM drains in-flight connections within a bounded grace period before joining
//!   every piece of detached background work.
//! - [`RateLimiterStore`] keeps an independent token bucket per client IP, refilled lazily at
//!   check time, with a periodic sweep that reclaims clients gone idle.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use axum::{routing::get, Router};
//! use serve_throttle::config::RuntimeConfig;
//! use serve_throttle::infrastructure::{http, telemetry};
//! use serve_throttle::ServiceRuntime;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RuntimeConfig::from_file("service.toml")?;
//! let logger = telemetry::init(&config.logging)?;
//!
//! let store = config.rate_limit.build_store()?;
//! let sweeper = store.spawn_sweeper(config.sweep.sweep_config()?);
//!
//! let router = Router::new()
//!     .route("/v1/healthcheck", get(http::healthcheck))
//!     .fallback(http::not_found);
//! let router = http::with_panic_recovery(http::with_rate_limit(router, store), logger.clone());
//!
//! let runtime = ServiceRuntime::builder(router)
//!     .config(config.server)
//!     .logger(logger)
//!     .build()?;
//! runtime.run().await?;
//!
//! sweeper.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Rate Limiting
//!
//! Each client, identified by the source IP of its connection (never by a header), owns a bucket
//! of `burst` tokens refilled at `requests_per_second`. A request costs one token; an empty
//! bucket means `429 Too Many Requests` with `{"error": "rate limit exceeded"}`.
//!
//! ```rust
//! use serve_throttle::{ClientId, Quota, RateLimiterStore};
//!
//! let store = RateLimiterStore::new(Quota::new(2.0, 4).unwrap());
//! let client = ClientId::from("198.51.100.4");
//!
//! let allowed = (0..6).filter(|_| store.check(&client).is_allowed()).count();
//! assert_eq!(allowed, 4);
//! ```
//!
//! Nothing ticks per bucket. The elapsed time since a client's last check is turned into tokens
//! when it checks again, capped at `burst`. The only background work is the eviction sweep,
//! which by default runs every 60 seconds and drops clients not seen for 180 seconds. A client
//! that comes back after eviction simply starts over with a full bucket.
//!
//! A store built with [`RateLimiterStore::disabled`] admits everything and keeps no state.
//!
//! ### Storage
//!
//! Buckets live behind the [`Storage`] port:
//!
//! | Adapter | Locking | When |
//! |---------|---------|------|
//! | [`LockedStorage`] | one `Mutex` around one `HashMap` | default |
//! | [`ShardedStorage`] | `DashMap` shards | many cores contending on checks, or very large sweeps |
//!
//! Either way a check is one critical section: lookup, creation, refill and the decision happen
//! together, so two first-time requests from the same client cannot both see a fresh bucket.
//!
//! ## Lifecycle
//!
//! ```text
//! Starting --> Serving --signal--> Draining --> Terminated
//! ```
//!
//! On SIGINT or SIGTERM (or [`ShutdownHandle::trigger`]) the runtime stops accepting, asks each
//! connection to finish its current request, and waits up to `shutdown_grace`. Connections still
//! open after that are aborted and `run` reports [`DrainError::GraceElapsed`]. Background work
//! started through [`ServiceRuntime::background`] or a [`TaskTracker`] clone is then waited for
//! **without a timeout**: a background task that never finishes keeps the process alive.
//!
//! Background work is isolated. An `Err` or a panic is logged at ERROR level and counted in
//! [`TaskTracker::failed_count`]; it is never retried and never reaches the caller.
//!
//! ## Logging
//!
//! Components log through `tracing`, each into the [`Logger`] it was built with (by default the
//! subscriber that was current at construction). [`infrastructure::telemetry::init`] installs a
//! `tracing-subscriber` fmt layer, pretty or JSON, filtered by `RUST_LOG` or the config file.

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

pub mod config;

// Re-export commonly used types for convenience
pub use domain::{
    bucket::{Decision, Quota, QuotaError, TokenBucket},
    client::{ClientEntry, ClientId},
};

pub use application::{
    logger::Logger,
    metrics::{Metrics, MetricsSnapshot, RequestMetrics, RequestMetricsSnapshot},
    ports::{Clock, Storage},
    store::RateLimiterStore,
    sweeper::{EvictionSweeper, ShutdownError, SweepConfig, SweepConfigError, SweeperHandle},
    tracker::{TaskGuard, TaskTracker},
};

pub use infrastructure::{
    clock::SystemClock,
    runtime::{DrainError, LifecycleState, ServeError, ServiceRuntime, ServiceRuntimeBuilder},
    signal::{ShutdownHandle, ShutdownSignal},
    storage::{LockedStorage, ShardedStorage},
};

pub use config::{ConfigError, RuntimeConfig};
