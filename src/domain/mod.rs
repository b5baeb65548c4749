//! Domain layer - pure rate limiting logic with no runtime dependencies.
//!
//! - Token bucket arithmetic and quota validation
//! - Client identity and per-client state
//!
//! All types in this layer take time as an argument and are easily testable.

pub mod bucket;
pub mod client;
