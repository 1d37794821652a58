//! Processing session state machine.
//!
//! One [`ProcessingSession`] tracks the batch processing of one search
//! session:
//!
//! ```text
//! pending ──start──▶ in_progress ──complete──▶ completed
//!    ▲                    │
//!    │                    └──fail──▶ failed ──reset_for_retry──┐
//!    └─────────────────────────────────────────────────────────┘
//! ```
//!
//! `partial` is a terminal status that can be stored and restarted from,
//! but no transition here produces it.
//!
//! The methods mutate in memory only; stores persist the result.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::models::{BatchOutcome, ItemFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Partial,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::InProgress => "in_progress",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "in_progress" => Ok(ProcessingStatus::InProgress),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            "partial" => Ok(ProcessingStatus::Partial),
            other => anyhow::bail!("unknown processing status: '{}'", other),
        }
    }
}

/// Pipeline stage a session is in. Stages are informational; any stage may
/// follow any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Initialization,
    UrlNormalization,
    MetadataExtraction,
    Deduplication,
    QualityScoring,
    Finalization,
}

impl ProcessingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStage::Initialization => "initialization",
            ProcessingStage::UrlNormalization => "url_normalization",
            ProcessingStage::MetadataExtraction => "metadata_extraction",
            ProcessingStage::Deduplication => "deduplication",
            ProcessingStage::QualityScoring => "quality_scoring",
            ProcessingStage::Finalization => "finalization",
        }
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ProcessingStage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "initialization" => Ok(ProcessingStage::Initialization),
            "url_normalization" => Ok(ProcessingStage::UrlNormalization),
            "metadata_extraction" => Ok(ProcessingStage::MetadataExtraction),
            "deduplication" => Ok(ProcessingStage::Deduplication),
            "quality_scoring" => Ok(ProcessingStage::QualityScoring),
            "finalization" => Ok(ProcessingStage::Finalization),
            other => anyhow::bail!("unknown processing stage: '{}'", other),
        }
    }
}

/// One recorded error, oldest first in [`ProcessingSession::error_details`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub details: Option<String>,
}

impl ErrorDetail {
    /// The entry recorded for a raw result that failed processing.
    pub fn item_failure(failure: &ItemFailure) -> Self {
        Self {
            timestamp: Utc::now(),
            message: format!("failed to process raw result {}", failure.raw_result_id),
            details: Some(failure.message.clone()),
        }
    }
}

/// Counters to overwrite in [`ProcessingSession::update_progress`]. `None`
/// leaves the stored value alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounts {
    pub processed: Option<u64>,
    pub errors: Option<u64>,
    pub duplicates: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The session had already completed; nothing was changed.
    AlreadyCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSession {
    pub session_id: String,
    pub status: ProcessingStatus,
    pub current_stage: ProcessingStage,
    pub stage_progress: u8,
    pub total_raw_results: u64,
    pub processed_count: u64,
    pub error_count: u64,
    pub duplicate_count: u64,
    pub retry_count: u32,
    pub task_id: Option<String>,
    pub error_details: Vec<ErrorDetail>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl ProcessingSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            status: ProcessingStatus::Pending,
            current_stage: ProcessingStage::Initialization,
            stage_progress: 0,
            total_raw_results: 0,
            processed_count: 0,
            error_count: 0,
            duplicate_count: 0,
            retry_count: 0,
            task_id: None,
            error_details: Vec::new(),
            started_at: None,
            completed_at: None,
            last_heartbeat: None,
        }
    }

    /// Begin a run over `total` raw results. The run counters and the error
    /// log start empty, so `error_count` always matches `error_details`.
    ///
    /// Allowed from `pending`, `failed` and `partial`. A completed session
    /// is left untouched and reported as [`StartOutcome::AlreadyCompleted`];
    /// a session already in progress is rejected.
    pub fn start_processing(
        &mut self,
        total: u64,
        task_id: Option<String>,
    ) -> Result<StartOutcome, SessionError> {
        match self.status {
            ProcessingStatus::Completed => return Ok(StartOutcome::AlreadyCompleted),
            ProcessingStatus::InProgress => {
                return Err(SessionError::InvalidTransition {
                    action: "start",
                    status: self.status,
                })
            }
            ProcessingStatus::Pending | ProcessingStatus::Failed | ProcessingStatus::Partial => {}
        }

        let now = Utc::now();
        self.status = ProcessingStatus::InProgress;
        self.started_at = Some(now);
        self.last_heartbeat = Some(now);
        self.completed_at = None;
        self.current_stage = ProcessingStage::Initialization;
        self.stage_progress = 0;
        self.total_raw_results = total;
        self.processed_count = 0;
        self.error_count = 0;
        self.error_details.clear();
        self.duplicate_count = 0;
        self.task_id = task_id;
        Ok(StartOutcome::Started)
    }

    /// Record the current stage and overwrite the provided counters with
    /// cumulative totals. `pct` above 100 is clamped.
    pub fn update_progress(&mut self, stage: ProcessingStage, pct: u8, counts: ProgressCounts) {
        self.last_heartbeat = Some(Utc::now());
        self.current_stage = stage;
        self.stage_progress = pct.min(100);
        if let Some(processed) = counts.processed {
            self.processed_count = processed;
        }
        if let Some(errors) = counts.errors {
            self.error_count = errors;
        }
        if let Some(duplicates) = counts.duplicates {
            self.duplicate_count = duplicates;
        }
    }

    /// Append an error and bump `error_count`. Status is unchanged.
    pub fn add_error(&mut self, message: impl Into<String>, details: Option<String>) {
        self.error_details.push(ErrorDetail {
            timestamp: Utc::now(),
            message: message.into(),
            details,
        });
        self.error_count += 1;
    }

    /// Fold a finished batch into the counters.
    pub fn apply_batch(&mut self, outcome: &BatchOutcome) {
        self.processed_count += outcome.processed;
        for failure in &outcome.failures {
            self.error_details.push(ErrorDetail::item_failure(failure));
            self.error_count += 1;
        }
        self.last_heartbeat = Some(Utc::now());
    }

    pub fn complete_processing(&mut self) -> Result<(), SessionError> {
        match self.status {
            ProcessingStatus::Pending | ProcessingStatus::InProgress => {}
            status => {
                return Err(SessionError::InvalidTransition {
                    action: "complete",
                    status,
                })
            }
        }
        let now = Utc::now();
        self.status = ProcessingStatus::Completed;
        self.completed_at = Some(now);
        self.last_heartbeat = Some(now);
        self.current_stage = ProcessingStage::Finalization;
        self.stage_progress = 100;
        Ok(())
    }

    pub fn fail_processing(&mut self, message: impl Into<String>, details: Option<String>) {
        let now = Utc::now();
        self.status = ProcessingStatus::Failed;
        self.completed_at = Some(now);
        self.last_heartbeat = Some(now);
        self.add_error(message, details);
    }

    /// Return a failed session to `pending` with a clean slate.
    pub fn reset_for_retry(&mut self) -> Result<(), SessionError> {
        if self.status != ProcessingStatus::Failed {
            return Err(SessionError::InvalidTransition {
                action: "retry",
                status: self.status,
            });
        }
        self.status = ProcessingStatus::Pending;
        self.current_stage = ProcessingStage::Initialization;
        self.stage_progress = 0;
        self.total_raw_results = 0;
        self.processed_count = 0;
        self.error_count = 0;
        self.duplicate_count = 0;
        self.task_id = None;
        self.error_details.clear();
        self.started_at = None;
        self.completed_at = None;
        self.last_heartbeat = None;
        self.retry_count += 1;
        Ok(())
    }

    /// Share of raw results processed, in percent.
    pub fn progress_percentage(&self) -> f64 {
        if self.total_raw_results == 0 {
            return 0.0;
        }
        let pct = self.processed_count as f64 / self.total_raw_results as f64 * 100.0;
        pct.min(100.0)
    }

    /// Seconds between start and completion, or `now` while still running.
    pub fn duration_seconds(&self, now: DateTime<Utc>) -> Option<f64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or(now);
        Some((end - started).num_milliseconds() as f64 / 1000.0)
    }

    /// Linear extrapolation of the finish time from the processing rate so
    /// far.
    pub fn estimated_completion(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let started = self.started_at?;
        if self.processed_count == 0 {
            return None;
        }
        let elapsed_ms = (now - started).num_milliseconds();
        if elapsed_ms <= 0 {
            return None;
        }
        let rate = self.processed_count as f64 / elapsed_ms as f64;
        if rate <= 0.0 {
            return None;
        }
        let remaining = self.total_raw_results.saturating_sub(self.processed_count);
        let remaining_ms = (remaining as f64 / rate).round() as i64;
        Some(now + Duration::milliseconds(remaining_ms))
    }

    /// The last `n` errors, oldest first.
    pub fn recent_errors(&self, n: usize) -> &[ErrorDetail] {
        let start = self.error_details.len().saturating_sub(n);
        &self.error_details[start..]
    }

    pub fn is_active(&self) -> bool {
        self.status == ProcessingStatus::InProgress
    }
}
