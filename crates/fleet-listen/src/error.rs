//! Error types for listeners.

use fleet_coord::CoordError;
use fleet_state::StateError;
use thiserror::Error;

pub type ListenResult<T> = Result<T, ListenError>;

#[derive(Debug, Error)]
pub enum ListenError {
    /// Shutdown was requested while waiting. Not a failure.
    #[error("listener shut down")]
    Shutdown,

    #[error("coordination store error: {0}")]
    Store(#[from] CoordError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("leader payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ListenError {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}
