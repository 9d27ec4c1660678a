//! Driver error types.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors a cloud driver may report.
///
/// Everything except `NotFound` and `Config` is transient from the engine's
/// point of view: the failed action is retried on the next pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("machine not found: {0}")]
    NotFound(String),

    #[error("cloud provider error: {0}")]
    Provider(String),

    #[error("driver call {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("driver configuration error: {0}")]
    Config(String),
}

impl DriverError {
    /// Create a provider error.
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
