//! Common error types for offsync.

use thiserror::Error;

/// Top-level error type for offsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Resource id is malformed (too long, whitespace, reserved characters).
    #[error("Invalid id: {0}")]
    InvalidId(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists, or a write collides with a pending one.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Cache or path resolution failed unexpectedly.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The server rejected a write whose version tag does not match.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// The network is not reachable.
    #[error("Not reachable: {0}")]
    Unreachable(String),

    /// Any other failure reported by the transport.
    #[error("Transport error ({status}): {message}")]
    Transport { status: u16, message: String },

    /// Storage backend operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Whether this error means the server could not be reached at all.
    pub fn is_connectivity_error(&self) -> bool {
        matches!(self, Error::Unreachable(_))
    }

    /// Whether this error is a version-tag mismatch.
    pub fn is_precondition_failure(&self) -> bool {
        matches!(self, Error::PreconditionFailed(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
