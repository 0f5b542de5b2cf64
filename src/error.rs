//! Error types for the content cluster controller.
//!
//! This module provides a unified error type [`ControllerError`] for the
//! operations that can surface to a caller, along with a convenient
//! [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Configuration**: invalid settings, or an identity change that makes
//!   it unsafe for this replica to keep operating
//! - **Coordination store**: the store is unreachable or rejected a write
//! - **State**: malformed cluster state text or node state values
//! - **Serialization**: host info or config JSON that could not be parsed
//!
//! Node-local anomalies (timeouts, refused connections, unknown RPC methods)
//! never show up here. They are absorbed by the control loop and turned into
//! node states; see [`crate::communicator::RpcError`].
//!
//! # Example
//!
//! ```rust
//! use content_controller::error::{ControllerError, Result};
//!
//! fn check_ratio(ratio: f64) -> Result<()> {
//!     if !(0.0..=1.0).contains(&ratio) {
//!         return Err(ControllerError::InvalidConfig {
//!             field: "policy.min_storage_up_ratio".into(),
//!             reason: "ratio must be within [0, 1]".into(),
//!         });
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_ratio(1.5).is_err());
//! ```

use std::io;
use thiserror::Error;

/// Main error type for controller operations.
#[derive(Error, Debug)]
pub enum ControllerError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Controller identity changed from {old} to {new}; refusing to continue")]
    IdentityChanged { old: String, new: String },

    // Coordination store errors
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Coordination store write rejected: {0}")]
    StoreWriteRejected(String),

    // State errors
    #[error("Invalid cluster state: {0}")]
    InvalidState(String),

    #[error("Invalid node state for {node}: {reason}")]
    InvalidNodeState { node: String, reason: String },

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    // Control loop errors
    #[error("Control loop stopped")]
    Stopped,

    // Generic errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    /// Check if this error is retryable.
    ///
    /// The control loop retries store operations every tick, so store
    /// errors are retryable. Everything else needs a change of input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControllerError::StoreUnavailable(_) | ControllerError::StoreWriteRejected(_)
        )
    }

    /// Check if this error must stop the controller for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ControllerError::IdentityChanged { .. })
    }
}

impl From<serde_json::Error> for ControllerError {
    fn from(e: serde_json::Error) -> Self {
        ControllerError::Serialization(e.to_string())
    }
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_retryable() {
        assert!(ControllerError::StoreUnavailable("down".into()).is_retryable());
        assert!(ControllerError::StoreWriteRejected("cas".into()).is_retryable());
        assert!(!ControllerError::InvalidState("x".into()).is_retryable());
    }

    #[test]
    fn test_identity_change_is_fatal() {
        let err = ControllerError::IdentityChanged {
            old: "music/0".into(),
            new: "music/1".into(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("music/1"));
    }

    #[test]
    fn test_json_error_conversion() {
        let err: ControllerError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, ControllerError::Serialization(_)));
    }
}
