//! Error types for projection operations

use thiserror::Error;

use crate::events::ResourceId;

/// Errors surfaced by the projection, subscription and query layers
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// Resource or device has no folded state after a bounded reload attempt,
    /// or the target is outside the caller's authorized device set
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient event-store failure during catch-up or reload
    #[error("event store error: {0}")]
    Store(String),

    /// Transient event-bus failure while subscribing or publishing
    #[error("event bus error: {0}")]
    Bus(String),

    /// A non-empty event batch produced no usable aggregate state
    #[error("invalid aggregate state for {0}: no resource id was ever folded")]
    EmptyAggregate(ResourceId),

    /// Event payload could not be decoded
    #[error("malformed event: {0}")]
    MalformedEvent(String),
}

/// Result type for projection operations
pub type ProjectionResult<T> = std::result::Result<T, ProjectionError>;

impl From<serde_json::Error> for ProjectionError {
    fn from(err: serde_json::Error) -> Self {
        ProjectionError::MalformedEvent(err.to_string())
    }
}

impl ProjectionError {
    /// Transient errors are safe for the caller to retry; `NotFound` after a
    /// reload is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProjectionError::Store(_) | ProjectionError::Bus(_))
    }
}
