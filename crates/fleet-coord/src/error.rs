//! Error types for the coordination store.

use thiserror::Error;

use crate::Version;

/// Result type alias for coordination store operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors returned by a [`Connection`](crate::Connection).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordError {
    #[error("no node at {path}")]
    NoNode { path: String },

    #[error("node already exists at {path}")]
    NodeExists { path: String },

    #[error("bad version at {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: Version,
        actual: Version,
    },

    #[error("node at {path} has children")]
    NotEmpty { path: String },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}
