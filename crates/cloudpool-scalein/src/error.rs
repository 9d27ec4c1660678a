//! Scale-in error types.

use thiserror::Error;

/// Result type alias for scale-in operations.
pub type ScaleInResult<T> = Result<T, ScaleInError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScaleInError {
    #[error("empty candidate set")]
    EmptyCandidateSet,

    #[error("cannot select {requested} victims from {available} candidates")]
    NotEnoughCandidates { requested: usize, available: usize },

    #[error("instance_hour_margin must be smaller than 3600 seconds, got {0}")]
    InvalidMargin(i64),
}
