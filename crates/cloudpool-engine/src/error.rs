//! Engine error types.

use thiserror::Error;

use cloudpool_core::CoreError;
use cloudpool_driver::DriverError;
use cloudpool_scalein::ScaleInError;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("machine not found in pool: {0}")]
    NotFound(String),

    #[error(transparent)]
    Driver(DriverError),

    #[error(transparent)]
    ScaleIn(#[from] ScaleInError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("pool controller is shutting down")]
    ShuttingDown,
}

impl EngineError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

// A driver's NotFound surfaces as the engine's own NotFound.
impl From<DriverError> for EngineError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NotFound(id) => Self::NotFound(id),
            other => Self::Driver(other),
        }
    }
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidArgument(msg) => Self::InvalidArgument(msg),
            CoreError::Config(msg) => Self::Config(msg),
            other => Self::Config(other.to_string()),
        }
    }
}
