use thiserror::Error;
use uuid::Uuid;

use crate::execution::ExecutionStatus;

#[derive(Error, Debug)]
pub enum RunboxError {
    #[error("Code must not be empty")]
    EmptyCode,

    #[error("Timeout must be a positive number of seconds, got {0}")]
    InvalidTimeout(i64),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("No result for execution {0}: status is {1}")]
    ResultNotAvailable(Uuid, ExecutionStatus),

    #[error("Execution {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Resource limits not supported by backend: {0}")]
    LimitsUnsupported(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RunboxError {
    /// Errors raised before any record is created or backend invoked.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RunboxError::EmptyCode
                | RunboxError::InvalidTimeout(_)
                | RunboxError::InvalidInput(_)
                | RunboxError::LimitsUnsupported(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RunboxError::ExecutionNotFound(_) | RunboxError::ResultNotAvailable(..)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RunboxError::InvalidTransition { .. })
    }
}

pub type Result<T> = std::result::Result<T, RunboxError>;
