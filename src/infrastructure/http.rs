//! HTTP glue: the rate limiting and request metrics middleware, JSON error
//! responses, the healthcheck handler and panic recovery.

use crate::application::logger::Logger;
use crate::application::metrics::RequestMetrics;
use crate::application::ports::Storage;
use crate::application::store::RateLimiterStore;
use crate::application::tracker::panic_message;
use crate::domain::bucket::Decision;
use crate::domain::client::{ClientEntry, ClientId};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::any::Any;
use std::fmt::Display;
use std::net::SocketAddr;
use tokio::time::Instant;
use tower_http::catch_panic::CatchPanicLayer;

const SERVER_ERROR_MESSAGE: &str = "the server encountered a problem and could not process your request";

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// A JSON `{"error": message}` response with the given status.
pub fn error_message(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorBody { error: message })).into_response()
}

/// 429 with `{"error": "rate limit exceeded"}`.
pub fn rate_limit_exceeded() -> Response {
    error_message(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded")
}

/// Log `err` and answer 500 without exposing it.
///
/// Logs to the current dispatch, which under
/// [`ServiceRuntime`](crate::ServiceRuntime) is the runtime's logger.
pub fn server_error(err: impl Display) -> Response {
    tracing::error!(error = %err, "server error");
    error_message(StatusCode::INTERNAL_SERVER_ERROR, SERVER_ERROR_MESSAGE)
}

/// 404 with a JSON body, suitable as a router fallback.
pub async fn not_found() -> Response {
    error_message(
        StatusCode::NOT_FOUND,
        "the requested resource could not be found",
    )
}

/// 405 with a JSON body naming the rejected method.
///
/// Meant for `Router::method_not_allowed_fallback` or a `MethodRouter` fallback.
pub async fn method_not_allowed(method: Method) -> Response {
    error_message(
        StatusCode::METHOD_NOT_ALLOWED,
        &format!("the {method} method is not supported for this resource"),
    )
}

/// Report that the service is up, with the crate version.
pub async fn healthcheck() -> Response {
    Json(json!({
        "status": "available",
        "system_info": {
            "version": env!("CARGO_PKG_VERSION"),
        },
    }))
    .into_response()
}

/// Middleware charging each request to its client's bucket.
///
/// The client is the peer IP from `ConnectInfo<SocketAddr>`. Requests without
/// connect info all share the `unknown` client.
pub async fn rate_limit<S>(
    State(store): State<RateLimiterStore<S>>,
    request: Request,
    next: Next,
) -> Response
where
    S: Storage<ClientId, ClientEntry> + Clone + 'static,
{
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| ClientId::from_socket_addr(*addr))
        .unwrap_or_else(ClientId::unknown);

    match store.check(&client) {
        Decision::Allowed => next.run(request).await,
        Decision::Denied => {
            store
                .logger()
                .in_scope(|| tracing::debug!(client = %client, "rate limit exceeded"));
            rate_limit_exceeded()
        }
    }
}

/// Put every route of `router` behind [`rate_limit`].
///
/// A disabled store still runs the middleware, which then admits everything.
pub fn with_rate_limit<S>(router: Router, store: RateLimiterStore<S>) -> Router
where
    S: Storage<ClientId, ClientEntry> + Clone + 'static,
{
    router.layer(middleware::from_fn_with_state(store, rate_limit::<S>))
}

/// Middleware counting every request, its response status and how long the
/// response took.
pub async fn track_requests(
    State(metrics): State<RequestMetrics>,
    request: Request,
    next: Next,
) -> Response {
    metrics.record_received();
    let started = Instant::now();
    let response = next.run(request).await;
    metrics.record_response(response.status().as_u16(), started.elapsed());
    response
}

/// Put every route of `router` behind [`track_requests`].
///
/// Apply it outermost so rate limited and recovered responses are counted too.
pub fn with_request_metrics(router: Router, metrics: RequestMetrics) -> Router {
    router.layer(middleware::from_fn_with_state(metrics, track_requests))
}

/// Serve a [`RequestMetrics`] snapshot as JSON.
pub async fn request_metrics(State(metrics): State<RequestMetrics>) -> Response {
    Json(metrics.snapshot()).into_response()
}

/// Turn a panicking handler into a 500 logged to `logger` instead of a
/// dropped connection.
pub fn with_panic_recovery(router: Router, logger: Logger) -> Router {
    router.layer(CatchPanicLayer::custom(
        move |payload: Box<dyn Any + Send + 'static>| {
            logger.in_scope(|| server_error(panic_message(payload.as_ref())))
        },
    ))
}
