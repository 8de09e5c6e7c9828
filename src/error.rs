//! Crate-wide error taxonomy. See `spec.md` §7.
//!
//! Variants hold owned `String`s (rather than wrapping foreign error types
//! directly, as the teacher's `thiserror` enums usually do) so that
//! [`StoreError`] can be `Clone` — single-flight coalescing (§4.4.2) must
//! hand the same error to every waiter, not just the caller that happened
//! to trigger the backend call.

use thiserror::Error;

/// Failure reading or writing the model layer (codec errors).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("failed to deserialize record: {0}")]
    Deserialize(String),
}

/// Failure from the store layer: either the in-memory store (which can
/// only fail on a logic error) or a persistent backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("operation attempted after close")]
    Closed,
}

impl From<ModelError> for StoreError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::Deserialize(msg) => StoreError::Serialization(msg),
        }
    }
}

/// Error kinds carried on data-source status transitions (§4.7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceErrorKind {
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream returned status {0}")]
    ErrorResponse(u16),
    #[error("invalid upstream payload: {0}")]
    InvalidData(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl SourceErrorKind {
    /// 401/403 are unrecoverable (§4.7); everything else is recoverable.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, SourceErrorKind::ErrorResponse(401 | 403))
    }
}

impl From<StoreError> for SourceErrorKind {
    fn from(e: StoreError) -> Self {
        SourceErrorKind::Store(e.to_string())
    }
}
