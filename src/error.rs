//! Error types for the batch pipeline.

use greylit_core::error::SessionError;

/// A failure that ends a processing run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("batch {batch} failed after {attempts} attempts: {message}")]
    BatchExhausted {
        batch: usize,
        attempts: u32,
        message: String,
    },

    #[error("batch worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("deduplication failed: {0}")]
    Deduplication(String),

    #[error("no processing session for search session {0}")]
    SessionMissing(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
