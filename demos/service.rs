//! A complete service: config, logging, rate limiting, background work and
//! graceful shutdown.
//!
//! Run with `cargo run --example service [config.toml]`, then try:
//!
//! ```text
//! curl -i localhost:4000/v1/healthcheck
//! curl -i -X POST localhost:4000/v1/reports
//! curl -s localhost:4000/debug/metrics
//! ```
//!
//! Ctrl-C stops accepting, lets in-flight requests finish, then waits for any
//! report still being generated.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serve_throttle::config::RuntimeConfig;
use serve_throttle::infrastructure::{http, telemetry};
use serve_throttle::{RequestMetrics, ServiceRuntime, TaskTracker};
use std::time::Duration;

#[derive(Clone)]
struct AppState {
    tracker: TaskTracker,
}

async fn create_report(State(state): State<AppState>) -> impl IntoResponse {
    state.tracker.spawn(async {
        tokio::time::sleep(Duration::from_secs(3)).await;
        tracing::info!("report generated");
        Ok::<_, std::io::Error>(())
    });
    StatusCode::ACCEPTED
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    let logger = telemetry::init(&config.logging)?;

    let store = config.rate_limit.build_store()?.with_logger(logger.clone());
    let sweeper = store.spawn_sweeper(config.sweep.sweep_config()?);

    let tracker = TaskTracker::with_logger(logger.clone());
    let requests = RequestMetrics::new();
    let router = Router::new()
        .route("/v1/healthcheck", get(http::healthcheck))
        .route("/v1/reports", post(create_report))
        .route(
            "/debug/metrics",
            get(http::request_metrics).with_state(requests.clone()),
        )
        .fallback(http::not_found)
        .method_not_allowed_fallback(http::method_not_allowed)
        .with_state(AppState {
            tracker: tracker.clone(),
        });
    let router = http::with_rate_limit(router, store.clone());
    let router = http::with_panic_recovery(router, logger.clone());
    let router = http::with_request_metrics(router, requests.clone());

    let runtime = ServiceRuntime::builder(router)
        .config(config.server)
        .tracker(tracker)
        .logger(logger)
        .build()?;

    let result = runtime.run().await;
    sweeper.shutdown().await?;

    let metrics = store.metrics().snapshot();
    tracing::info!(
        allowed = metrics.requests_allowed,
        denied = metrics.requests_denied,
        evicted = metrics.clients_evicted,
        "rate limiter totals"
    );
    let traffic = requests.snapshot();
    tracing::info!(
        received = traffic.requests_received,
        sent = traffic.responses_sent,
        avg_us = traffic.average_processing_time().as_micros() as u64,
        "request totals"
    );

    result.map_err(Into::into)
}
