//! Error types for the rollout engine.

use stagehand_store::StoreError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by engine operations.
///
/// The engine recovers nothing locally: any error aborts the current
/// tick and surfaces to the caller. Store and controller failures are
/// retryable; each tick step is idempotent given identical inputs.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("store failure: {0}")]
    Store(StoreError),

    #[error("controller failure: {0}")]
    Controller(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("version {0} is marked last known bad; use force to target it anyway")]
    Conflict(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        // A point-read miss is a caller-visible NotFound; everything
        // else is a store failure the caller may retry.
        match e {
            StoreError::KeyNotFound(key) => EngineError::NotFound(key),
            other => EngineError::Store(other),
        }
    }
}
