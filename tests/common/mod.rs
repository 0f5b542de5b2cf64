//! Common test utilities for controller integration tests.

pub mod assertions;
pub mod cluster_sim;
pub mod fixtures;

pub use assertions::*;
pub use cluster_sim::*;
pub use fixtures::*;

/// Result type for tests.
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
