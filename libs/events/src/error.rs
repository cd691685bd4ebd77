//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when building route events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The stable id is empty.
    #[error("stable id must not be empty")]
    EmptyId,

    /// The hostname cannot be routed.
    #[error("invalid hostname {hostname:?}: {reason}")]
    InvalidHostname {
        hostname: String,
        reason: &'static str,
    },

    /// The backend is not a `host:port` address.
    #[error("invalid backend {backend:?}: {reason}")]
    InvalidBackend {
        backend: String,
        reason: &'static str,
    },
}
