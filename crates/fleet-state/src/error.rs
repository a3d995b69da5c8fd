//! Error types for cluster state operations.
//!
//! Every variant names the operation and the node it was working on, so a
//! failure can be diagnosed without looking inside the store.

use std::time::Duration;

use fleet_coord::{CoordError, Version};
use thiserror::Error;

/// Result type alias for cluster state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while reading or mutating cluster state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("{op} {path}: not found")]
    NotFound { op: &'static str, path: String },

    #[error("{op} {path}: version conflict (expected {expected}, found {actual})")]
    VersionConflict {
        op: &'static str,
        path: String,
        expected: Version,
        actual: Version,
    },

    #[error("{op} {path}: already exists")]
    AlreadyExists { op: &'static str, path: String },

    #[error("{op} {path}: timed out after {waited:?}")]
    Timeout {
        op: &'static str,
        path: String,
        waited: Duration,
    },

    #[error("{op} {path}: shutdown requested")]
    Shutdown { op: &'static str, path: String },

    #[error("{op} {path}: malformed payload: {reason}")]
    Malformed {
        op: &'static str,
        path: String,
        reason: String,
    },

    #[error("{op} {path}: failed to encode payload: {reason}")]
    Encode {
        op: &'static str,
        path: String,
        reason: String,
    },

    #[error("invalid identifier {0:?}")]
    InvalidId(String),

    #[error("snapshot request {path} already carries an outcome")]
    AlreadyFulfilled { path: String },

    /// The fulfiller reported a failure; displays exactly its message.
    #[error("{message}")]
    SnapshotFailed { request_id: String, message: String },

    #[error("{op} {path}: {source}")]
    Store {
        op: &'static str,
        path: String,
        #[source]
        source: CoordError,
    },
}

impl StateError {
    /// Classify a store error raised by `op` on `path`.
    pub fn from_coord(op: &'static str, path: &str, err: CoordError) -> Self {
        let path = path.to_string();
        match err {
            CoordError::NoNode { .. } => Self::NotFound { op, path },
            CoordError::NodeExists { .. } => Self::AlreadyExists { op, path },
            CoordError::BadVersion {
                expected, actual, ..
            } => Self::VersionConflict {
                op,
                path,
                expected,
                actual,
            },
            source => Self::Store { op, path, source },
        }
    }

    /// Closure factory for `map_err`.
    pub(crate) fn coord<'a>(
        op: &'static str,
        path: &'a str,
    ) -> impl FnOnce(CoordError) -> Self + 'a {
        move |err| Self::from_coord(op, path, err)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown { .. })
    }
}
