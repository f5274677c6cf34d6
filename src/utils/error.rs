//! Error rollup
//!
//! Each stage of the pipeline has its own error enum; `PipelineError` is the
//! umbrella for callers that drive several stages and want one type to match
//! on or to hand to a UI layer as a coded response.

use crate::capture::CaptureError;
use crate::channel::ChannelError;
use crate::composite::CompositeError;
use crate::coordinator::CoordinatorError;
use crate::store::StoreError;
use crate::transfer::TransferError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Umbrella error across the whole pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Composite(#[from] CompositeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Stable machine-readable code for the error's stage.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Store(_) => "STORE_ERROR",
            PipelineError::Capture(_) => "CAPTURE_ERROR",
            PipelineError::Channel(_) => "CHANNEL_ERROR",
            PipelineError::Coordinator(_) => "COORDINATOR_ERROR",
            PipelineError::Transfer(_) => "TRANSFER_ERROR",
            PipelineError::Composite(_) => "COMPOSITE_ERROR",
            PipelineError::Io(_) => "IO_ERROR",
            PipelineError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Error response for a frontend or API surface
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<PipelineError> for ErrorResponse {
    fn from(error: PipelineError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;
