//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain logic and manages the runtime behavior:
//! - Rate limiter store (per-client buckets, checks, sweeps)
//! - Eviction sweeper (periodic reclamation of idle clients)
//! - Task tracker (counted, fault-isolated background work)
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod logger;
pub mod metrics;
pub mod ports;
pub mod store;
pub mod sweeper;
pub mod tracker;
