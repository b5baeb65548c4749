//! `tracing-subscriber` setup for binaries.

use crate::application::logger::Logger;
use crate::config::{LogFormat, LoggingConfig};
use tracing::Dispatch;
use tracing_subscriber::filter::{EnvFilter, ParseError};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;

/// Errors from building or installing the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The filter directive is malformed
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    /// A global subscriber is already installed
    #[error("global subscriber already set: {0}")]
    AlreadySet(#[from] tracing::dispatcher::SetGlobalDefaultError),
}

/// Build a subscriber from `config` without installing it.
///
/// `RUST_LOG`, when set and valid, replaces `config.filter`.
pub fn build(config: &LoggingConfig) -> Result<Dispatch, TelemetryError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)?,
    };
    let registry = tracing_subscriber::registry().with(filter);

    let dispatch = match config.format {
        LogFormat::Pretty => Dispatch::new(registry.with(fmt::layer().pretty())),
        LogFormat::Json => Dispatch::new(registry.with(fmt::layer().json())),
    };
    Ok(dispatch)
}

/// Install the subscriber globally and return a logger bound to it.
pub fn init(config: &LoggingConfig) -> Result<Logger, TelemetryError> {
    let dispatch = build(config)?;
    tracing::dispatcher::set_global_default(dispatch.clone())?;
    Ok(Logger::new(dispatch))
}
