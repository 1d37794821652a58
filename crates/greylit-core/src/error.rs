//! Error types shared by the core state machine and result derivation.

use crate::session::ProcessingStatus;

/// A processing-session transition that is not valid from the current status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("cannot {action} a processing session that is {status}")]
    InvalidTransition {
        action: &'static str,
        status: ProcessingStatus,
    },
}

/// A per-result data problem. The offending raw result is skipped and
/// annotated; the batch carries on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemError {
    #[error("raw result has no title")]
    MissingTitle,

    #[error("malformed URL: {0}")]
    MalformedUrl(String),

    #[error("failed to persist processed result: {0}")]
    Persist(String),
}
