//! Infrastructure layer - external adapters and integrations.
//!
//! This layer provides adapters for:
//! - Clock abstraction (tokio time vs mock)
//! - Storage implementations (single lock or sharded maps)
//! - HTTP integration (axum middleware, responses, the service runtime)
//! - Process integration (signals, subscriber setup)

pub mod clock;
pub mod connection;
pub mod http;
pub mod runtime;
pub mod signal;
pub mod storage;
pub mod telemetry;

/// Mock implementations for testing.
///
/// This module is only available when the `test-helpers` feature is enabled,
/// or during test builds. It provides controllable test doubles for driving
/// limiter time and capturing log output.
///
/// To use these mocks in integration tests, add to your `Cargo.toml`:
/// ```toml
/// [dev-dependencies]
/// serve-throttle = { version = "*", features = ["test-helpers"] }
/// ```
#[cfg(any(test, feature = "test-helpers"))]
pub mod mocks;
