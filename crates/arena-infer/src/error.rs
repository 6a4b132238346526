//! Inference error types

use arena_core::PolicyError;
use arena_selfplay::CheckpointError;
use thiserror::Error;

/// Errors answered to the requester as `{"error":{"kind","message"}}`
#[derive(Debug, Error)]
pub enum InferError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Model loader failed: {0}")]
    Loader(String),
}

impl InferError {
    /// Stable machine-readable kind for the error record
    pub fn kind(&self) -> &'static str {
        match self {
            InferError::UnknownModel(_) => "unknown_model",
            InferError::Checkpoint(CheckpointError::Corrupt { .. }) => "corrupt_checkpoint",
            InferError::Checkpoint(_) => "checkpoint",
            InferError::Policy(_) => "policy",
            InferError::BadRequest(_) => "bad_request",
            InferError::Loader(_) => "internal",
        }
    }
}
