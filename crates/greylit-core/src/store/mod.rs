//! Storage abstraction for greylit.
//!
//! The [`ResultStore`] trait defines every storage operation the processing
//! pipeline needs, so the orchestrator runs unchanged against SQLite, the
//! in-memory store, or a test double.
//!
//! Implementations must be `Send + Sync` to be shared by batch workers.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{BatchOutcome, DuplicateGroup, ProcessedResult, RawResult};
use crate::session::{ProcessingSession, ProcessingStage};

/// Result of [`ResultStore::insert_processed_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A processed result for the same raw result already exists; nothing
    /// was written.
    AlreadyExists,
}

/// A group to persist together with the ids of all its members, the
/// canonical one included.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupAssignment {
    pub group: DuplicateGroup,
    pub member_ids: Vec<String>,
}

/// Abstract storage backend for search results and processing state.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`register_search_session`](ResultStore::register_search_session) | Create a search session if missing |
/// | [`insert_raw_results`](ResultStore::insert_raw_results) | Ingest raw results |
/// | [`unprocessed_raw_result_ids`](ResultStore::unprocessed_raw_result_ids) | Work list for a run |
/// | [`insert_processed_result`](ResultStore::insert_processed_result) | Persist one derived result |
/// | [`replace_duplicate_groups`](ResultStore::replace_duplicate_groups) | Swap a session's groups atomically |
/// | [`get_or_create_processing_session`](ResultStore::get_or_create_processing_session) | Load the state machine |
/// | [`try_start_processing`](ResultStore::try_start_processing) | Claim a pending session for one run |
/// | [`apply_batch_outcome`](ResultStore::apply_batch_outcome) | Atomic counter update from a batch |
/// | [`reset_failed_session`](ResultStore::reset_failed_session) | Return a failed session to pending with its derived data cleared |
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Create the search session if it does not exist yet.
    async fn register_search_session(&self, session_id: &str, title: Option<&str>) -> Result<()>;

    async fn search_session_exists(&self, session_id: &str) -> Result<bool>;

    /// Insert raw results, skipping ids that are already stored. Returns the
    /// number inserted. Fails if a result's search session is unknown.
    async fn insert_raw_results(&self, results: &[RawResult]) -> Result<usize>;

    async fn raw_result_count(&self, session_id: &str) -> Result<u64>;

    /// Ids of raw results not yet processed, ordered by position.
    async fn unprocessed_raw_result_ids(&self, session_id: &str) -> Result<Vec<String>>;

    /// Raw results with the given ids, ordered by position. Unknown ids are
    /// skipped.
    async fn raw_results_by_ids(&self, ids: &[String]) -> Result<Vec<RawResult>>;

    /// Set `is_processed` and clear any previous error.
    async fn mark_raw_processed(&self, raw_id: &str) -> Result<()>;

    async fn mark_raw_failed(&self, raw_id: &str, error: &str) -> Result<()>;

    /// Insert a processed result, unique per `(session_id, raw_result_id)`.
    async fn insert_processed_result(&self, result: &ProcessedResult) -> Result<InsertOutcome>;

    /// All processed results of a session, ordered by position then id.
    async fn processed_results(&self, session_id: &str) -> Result<Vec<ProcessedResult>>;

    /// Delete the session's groups, clear every `duplicate_group_id`, then
    /// write the new groups and member links. All or nothing.
    async fn replace_duplicate_groups(
        &self,
        session_id: &str,
        groups: &[GroupAssignment],
    ) -> Result<()>;

    async fn duplicate_groups(&self, session_id: &str) -> Result<Vec<DuplicateGroup>>;

    async fn duplicate_group(&self, group_id: &str) -> Result<Option<DuplicateGroup>>;

    /// Processed results linked to the group, ordered by position.
    async fn group_members(&self, group_id: &str) -> Result<Vec<ProcessedResult>>;

    async fn update_duplicate_group(&self, group: &DuplicateGroup) -> Result<()>;

    async fn processing_session(&self, session_id: &str) -> Result<Option<ProcessingSession>>;

    async fn get_or_create_processing_session(&self, session_id: &str)
        -> Result<ProcessingSession>;

    /// Overwrite the whole processing session record.
    async fn save_processing_session(&self, session: &ProcessingSession) -> Result<()>;

    /// Update only the stage, stage progress and heartbeat.
    async fn record_stage(&self, session_id: &str, stage: ProcessingStage, pct: u8)
        -> Result<()>;

    /// Move a `pending` processing session to `in_progress` over `total` raw
    /// results, as one atomic check-and-set. Returns `None` when the session
    /// is missing or not pending, so concurrent callers get at most one
    /// claim.
    async fn try_start_processing(
        &self,
        session_id: &str,
        total: u64,
        task_id: &str,
    ) -> Result<Option<ProcessingSession>>;

    /// Fold a batch outcome into the processing session as one atomic
    /// read-modify-write and return the updated session.
    async fn apply_batch_outcome(
        &self,
        session_id: &str,
        outcome: &BatchOutcome,
    ) -> Result<ProcessingSession>;

    /// If the processing session is `failed`, reset it for retry, delete the
    /// session's processed results and groups, and clear `is_processed` and
    /// `processing_error` on its raw results. All or nothing. Returns `None`
    /// without writing when the session is missing or not failed.
    async fn reset_failed_session(&self, session_id: &str) -> Result<Option<ProcessingSession>>;
}
