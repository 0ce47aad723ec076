//! Error taxonomy shared by the orchestrator, store and HTTP layer.

use thiserror::Error;

use crate::core::pipeline::Stage;
use crate::domain::InvalidTransition;

/// Errors surfaced by deployment operations.
///
/// Messages are human-readable summaries; they are shown to clients as-is.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    #[error("Deployment not found: {0}")]
    NotFound(String),

    #[error("{stage} failed: {message}")]
    Stage { stage: Stage, message: String },

    #[error("Deployment timed out after {limit_secs}s")]
    Timeout { limit_secs: u64 },

    #[error(transparent)]
    Persistence(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    pub fn stage(stage: Stage, message: impl Into<String>) -> Self {
        Self::Stage {
            stage,
            message: message.into(),
        }
    }
}

/// Job record store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid job id: {0}")]
    InvalidId(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the failure means the job record does not exist (yet)
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Why a live subscriber could not be written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("subscriber queue is full")]
    QueueFull,

    #[error("subscriber connection is closed")]
    Closed,
}
