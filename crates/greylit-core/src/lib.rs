//! # greylit core
//!
//! Runtime-free logic for the greylit result pipeline: data models, the
//! similarity scorer, metadata extraction, the duplicate detector, the
//! processing-session state machine, statistics, and the store abstraction.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. The native shell
//! (`greylit`) supplies the SQLite store, configuration, and the batch
//! orchestrator that drives these pieces.

pub mod dedup;
pub mod error;
pub mod metadata;
pub mod models;
pub mod session;
pub mod similarity;
pub mod statistics;
pub mod store;

pub use dedup::{DetectedGroup, DuplicateDetector, DuplicateMatch};
pub use error::{ItemError, SessionError};
pub use models::{
    BatchOutcome, DocumentType, DuplicateGroup, ItemFailure, ProcessedResult, RawResult,
    SimilarityType,
};
pub use session::{
    ErrorDetail, ProcessingSession, ProcessingStage, ProcessingStatus, ProgressCounts,
    StartOutcome,
};
pub use statistics::SessionStatistics;
pub use store::memory::InMemoryStore;
pub use store::{GroupAssignment, InsertOutcome, ResultStore};
