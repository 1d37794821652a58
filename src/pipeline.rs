//! Batch pipeline orchestration.
//!
//! Drives one processing run for a search session:
//!
//! ```text
//! unprocessed raw results
//!   └─ batches of `batch_size` ─▶ bounded worker pool (JoinSet + Semaphore)
//!        each batch: derive → persist → mark, then one atomic counter update
//!   ═══ barrier: all batches joined ═══
//!   └─ deduplication over every processed result of the session
//!   ═══ barrier ═══
//!   └─ statistics, duplicate count, session completed
//! ```
//!
//! A per-result failure is recorded and skipped. A batch-level failure is
//! retried with exponential backoff; running out of retries, a crashed
//! worker, or a storage failure at a barrier marks the session `failed`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use greylit_core::dedup::{select_canonical, DetectedGroup, DuplicateDetector};
use greylit_core::error::{ItemError, SessionError};
use greylit_core::metadata::derive_processed_result;
use greylit_core::models::{BatchOutcome, DuplicateGroup, ItemFailure, ProcessedResult, RawResult};
use greylit_core::session::{ProcessingSession, ProcessingStage, ProcessingStatus, ProgressCounts};
use greylit_core::similarity::url_domain;
use greylit_core::statistics::SessionStatistics;
use greylit_core::store::{GroupAssignment, InsertOutcome, ResultStore};

use crate::config::{Config, DedupConfig, PipelineConfig};
use crate::db;
use crate::error::{PipelineError, Result};
use crate::progress::{PipelineProgressEvent, ProgressMode, ProgressReporter};
use crate::sqlite_store::SqliteStore;

/// Largest backoff multiplier: `2^5 = 32` times the base delay.
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// What a call to [`Pipeline::process_session_results`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// A run was started; the report says how it ended.
    Started(RunReport),
    /// The session had already completed. Nothing was written.
    AlreadyCompleted,
    /// No unprocessed raw results; the session went straight to completed.
    NoResults,
    /// A precondition failed before any work began.
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub session_id: String,
    pub task_id: String,
    pub status: ProcessingStatus,
    pub total: u64,
    pub processed: u64,
    pub errors: u64,
    pub duplicate_groups: u64,
    pub duplicates: u64,
    pub statistics: Option<SessionStatistics>,
    pub failure: Option<String>,
}

/// Delay before retry `attempt` (1-based): `base * 2^(attempt - 1)`, with the
/// multiplier capped at 32.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    base.saturating_mul(1 << exponent)
}

/// The batch pipeline for one store.
pub struct Pipeline {
    store: Arc<dyn ResultStore>,
    detector: DuplicateDetector,
    batch_size: usize,
    max_concurrent_batches: usize,
    max_retries: u32,
    retry_base_delay: Duration,
    reporter: Arc<dyn ProgressReporter>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ResultStore>,
        pipeline: &PipelineConfig,
        dedup: &DedupConfig,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            store,
            detector: DuplicateDetector::new(dedup.similarity_threshold),
            batch_size: pipeline.batch_size.max(1),
            max_concurrent_batches: pipeline.max_concurrent_batches.max(1),
            max_retries: pipeline.max_retries,
            retry_base_delay: Duration::from_millis(pipeline.retry_base_delay_ms),
            reporter,
        }
    }

    /// Process every unprocessed raw result of a search session, then
    /// deduplicate and finalize.
    #[instrument(skip(self))]
    pub async fn process_session_results(&self, session_id: &str) -> RunOutcome {
        match self.try_process(session_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "processing could not start");
                RunOutcome::Error(e.to_string())
            }
        }
    }

    async fn try_process(&self, session_id: &str) -> Result<RunOutcome> {
        if !self.store.search_session_exists(session_id).await? {
            return Ok(RunOutcome::Error(format!(
                "unknown search session: {}",
                session_id
            )));
        }

        let session = self
            .store
            .get_or_create_processing_session(session_id)
            .await?;
        match session.status {
            ProcessingStatus::Completed => {
                info!("session already completed");
                return Ok(RunOutcome::AlreadyCompleted);
            }
            ProcessingStatus::InProgress => return Ok(already_running(session_id)),
            ProcessingStatus::Failed | ProcessingStatus::Partial => {
                return Ok(RunOutcome::Error(format!(
                    "processing session {} is {}; retry it to run again",
                    session_id, session.status
                )));
            }
            ProcessingStatus::Pending => {}
        }

        let ids = self.store.unprocessed_raw_result_ids(session_id).await?;
        let task_id = Uuid::new_v4().to_string();
        let Some(mut session) = self
            .store
            .try_start_processing(session_id, ids.len() as u64, &task_id)
            .await?
        else {
            return self.claim_lost(session_id).await;
        };

        if ids.is_empty() {
            session.complete_processing()?;
            self.store.save_processing_session(&session).await?;
            info!("no unprocessed results");
            return Ok(RunOutcome::NoResults);
        }
        info!(task_id = %task_id, total = ids.len(), "processing started");

        let report = match self.run(session_id, &task_id, ids).await {
            Ok(report) => report,
            Err(e) => self.fail_run(session_id, &task_id, e).await?,
        };
        Ok(RunOutcome::Started(report))
    }

    /// Another trigger moved the session out of `pending` first.
    async fn claim_lost(&self, session_id: &str) -> Result<RunOutcome> {
        let status = self
            .store
            .processing_session(session_id)
            .await?
            .map(|s| s.status);
        debug!(?status, "run claimed by another trigger");
        Ok(match status {
            Some(ProcessingStatus::Completed) => RunOutcome::AlreadyCompleted,
            _ => already_running(session_id),
        })
    }

    async fn run(&self, session_id: &str, task_id: &str, ids: Vec<String>) -> Result<RunReport> {
        let total = ids.len() as u64;

        self.enter_stage(session_id, ProcessingStage::UrlNormalization)
            .await?;
        self.process_batches(session_id, ids).await?;

        self.enter_stage(session_id, ProcessingStage::Deduplication)
            .await?;
        let groups = self.deduplicate(session_id).await?;
        let duplicates: u64 = groups.iter().map(DuplicateGroup::duplicate_count).sum();

        self.enter_stage(session_id, ProcessingStage::QualityScoring)
            .await?;
        let statistics = self.statistics(session_id).await?;

        let mut session = self
            .store
            .processing_session(session_id)
            .await?
            .ok_or_else(|| PipelineError::SessionMissing(session_id.to_string()))?;
        session.update_progress(
            ProcessingStage::Finalization,
            100,
            ProgressCounts {
                duplicates: Some(duplicates),
                ..Default::default()
            },
        );
        session.complete_processing()?;
        self.store.save_processing_session(&session).await?;

        info!(
            processed = session.processed_count,
            errors = session.error_count,
            groups = groups.len(),
            duplicates,
            "processing completed"
        );
        self.reporter.report(PipelineProgressEvent::Finished {
            session_id: session_id.to_string(),
            status: session.status,
            statistics: Some(statistics.clone()),
        });

        Ok(RunReport {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            status: session.status,
            total,
            processed: session.processed_count,
            errors: session.error_count,
            duplicate_groups: groups.len() as u64,
            duplicates,
            statistics: Some(statistics),
            failure: None,
        })
    }

    /// Mark the session failed after a fatal error and describe the run.
    async fn fail_run(
        &self,
        session_id: &str,
        task_id: &str,
        cause: PipelineError,
    ) -> Result<RunReport> {
        let message = cause.to_string();
        error!(error = %message, "processing failed");

        let mut session = self
            .store
            .processing_session(session_id)
            .await?
            .unwrap_or_else(|| ProcessingSession::new(session_id));
        session.fail_processing(message.clone(), None);
        self.store.save_processing_session(&session).await?;

        self.reporter.report(PipelineProgressEvent::Finished {
            session_id: session_id.to_string(),
            status: session.status,
            statistics: None,
        });

        Ok(RunReport {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            status: session.status,
            total: session.total_raw_results,
            processed: session.processed_count,
            errors: session.error_count,
            duplicate_groups: 0,
            duplicates: 0,
            statistics: None,
            failure: Some(message),
        })
    }

    async fn enter_stage(&self, session_id: &str, stage: ProcessingStage) -> Result<()> {
        self.store.record_stage(session_id, stage, 0).await?;
        self.reporter.report(PipelineProgressEvent::Stage {
            session_id: session_id.to_string(),
            stage,
        });
        Ok(())
    }

    /// Fan the ids out to the worker pool and wait for every batch. The
    /// first batch error is returned only after all tasks have finished.
    async fn process_batches(&self, session_id: &str, ids: Vec<String>) -> Result<()> {
        let total = ids.len() as u64;
        let batches: Vec<Vec<String>> = ids
            .chunks(self.batch_size)
            .map(<[String]>::to_vec)
            .collect();
        let total_batches = batches.len();
        if total_batches == 0 {
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_batches));
        let mut tasks = JoinSet::new();
        for (index, batch) in batches.into_iter().enumerate() {
            let worker = BatchWorker {
                store: Arc::clone(&self.store),
                session_id: session_id.to_string(),
                max_retries: self.max_retries,
                retry_base_delay: self.retry_base_delay,
            };
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::WorkerCrashed(e.to_string()))?;
                worker.run(index, batch).await
            });
        }
        debug!(batches = total_batches, "batches dispatched");

        let mut first_error: Option<PipelineError> = None;
        let mut completed = 0usize;
        let (mut processed, mut errors) = (0u64, 0u64);

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(session)) => {
                    completed += 1;
                    processed = processed.max(session.processed_count);
                    errors = errors.max(session.error_count);
                    let pct = (completed * 100 / total_batches) as u8;
                    if let Err(e) = self
                        .store
                        .record_stage(session_id, ProcessingStage::MetadataExtraction, pct)
                        .await
                    {
                        warn!(error = %e, "failed to record batch progress");
                    }
                    self.reporter.report(PipelineProgressEvent::Batch {
                        session_id: session_id.to_string(),
                        completed_batches: completed,
                        total_batches,
                        processed,
                        errors,
                        total,
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "batch failed");
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    error!(error = %join_error, "batch worker crashed");
                    first_error
                        .get_or_insert(PipelineError::WorkerCrashed(join_error.to_string()));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Rebuild the session's duplicate groups from all of its processed
    /// results. Returns the groups written.
    async fn deduplicate(&self, session_id: &str) -> Result<Vec<DuplicateGroup>> {
        let results = self.store.processed_results(session_id).await?;
        let detector = self.detector;
        let owner = session_id.to_string();

        let assignments = tokio::task::spawn_blocking(move || {
            let now = Utc::now();
            detector
                .find_groups(&results)
                .iter()
                .map(|group| build_assignment(&owner, group, now))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| PipelineError::Deduplication(e.to_string()))?;

        self.store
            .replace_duplicate_groups(session_id, &assignments)
            .await
            .map_err(|e| PipelineError::Deduplication(format!("{:#}", e)))?;

        info!(groups = assignments.len(), "duplicate groups written");
        Ok(assignments.into_iter().map(|a| a.group).collect())
    }

    /// Statistics computed from the current persisted state.
    pub async fn statistics(&self, session_id: &str) -> Result<SessionStatistics> {
        let total_raw = self.store.raw_result_count(session_id).await?;
        let results = self.store.processed_results(session_id).await?;
        let groups = self.store.duplicate_groups(session_id).await?;
        Ok(SessionStatistics::compute(total_raw, &results, &groups))
    }

    /// Re-run a failed session from scratch.
    #[instrument(skip(self))]
    pub async fn retry_failed_processing(&self, session_id: &str) -> RunOutcome {
        match self.reset_failed(session_id).await {
            Ok(()) => self.process_session_results(session_id).await,
            Err(e) => {
                warn!(error = %e, "retry rejected");
                RunOutcome::Error(e.to_string())
            }
        }
    }

    async fn reset_failed(&self, session_id: &str) -> Result<()> {
        let Some(session) = self.store.reset_failed_session(session_id).await? else {
            let current = self
                .store
                .processing_session(session_id)
                .await?
                .ok_or_else(|| PipelineError::SessionMissing(session_id.to_string()))?;
            return Err(SessionError::InvalidTransition {
                action: "retry",
                status: current.status,
            }
            .into());
        };
        info!(retry_count = session.retry_count, "session reset for retry");
        Ok(())
    }

    /// Promote the most metadata-complete member of a group to canonical and
    /// refresh its counts.
    #[instrument(skip(self))]
    pub async fn merge_duplicate_group(&self, group_id: &str) -> Result<DuplicateGroup> {
        let mut group = self
            .store
            .duplicate_group(group_id)
            .await?
            .ok_or_else(|| anyhow!("duplicate group not found: {}", group_id))?;
        let members = self.store.group_members(group_id).await?;
        let canonical = select_canonical(&members)
            .map(|i| &members[i])
            .ok_or_else(|| anyhow!("duplicate group {} has no members", group_id))?;

        group.canonical_result_id = canonical.id.clone();
        group.canonical_url = canonical.normalized_url.clone();
        group.result_count = u32::try_from(members.len()).unwrap_or(u32::MAX);
        group.sources = distinct_domains(members.iter());

        self.store.update_duplicate_group(&group).await?;
        info!(canonical = %group.canonical_result_id, members = members.len(), "group merged");
        Ok(group)
    }
}

fn already_running(session_id: &str) -> RunOutcome {
    RunOutcome::Error(format!(
        "processing already in progress for session {}",
        session_id
    ))
}

/// Processes one batch, retrying it as a whole on batch-level errors.
struct BatchWorker {
    store: Arc<dyn ResultStore>,
    session_id: String,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl BatchWorker {
    async fn run(self, index: usize, ids: Vec<String>) -> Result<ProcessingSession> {
        let mut attempt = 0u32;
        loop {
            match self.attempt(index, &ids).await {
                Ok(session) => return Ok(session),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = backoff_delay(self.retry_base_delay, attempt);
                    warn!(
                        batch = index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %format!("{:#}", e),
                        "batch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(PipelineError::BatchExhausted {
                        batch: index,
                        attempts: attempt + 1,
                        message: format!("{:#}", e),
                    })
                }
            }
        }
    }

    /// One pass over the batch. Per-result problems become item failures;
    /// any other store error aborts the attempt.
    async fn attempt(&self, index: usize, ids: &[String]) -> anyhow::Result<ProcessingSession> {
        let raws = self
            .store
            .raw_results_by_ids(ids)
            .await
            .context("failed to load raw results")?;
        let mut outcome = BatchOutcome::new(index);
        let now = Utc::now();

        for id in ids {
            let Some(raw) = raws.iter().find(|r| &r.id == id) else {
                outcome.failures.push(ItemFailure {
                    raw_result_id: id.clone(),
                    message: "raw result no longer exists".to_string(),
                });
                continue;
            };
            if raw.is_processed {
                outcome.processed += 1;
                continue;
            }
            match self.process_one(raw, now).await {
                Ok(()) => outcome.processed += 1,
                Err(e) => {
                    let message = e.to_string();
                    debug!(batch = index, raw_result_id = %raw.id, error = %message, "result skipped");
                    self.store
                        .mark_raw_failed(&raw.id, &message)
                        .await
                        .context("failed to record result error")?;
                    outcome.failures.push(ItemFailure {
                        raw_result_id: raw.id.clone(),
                        message,
                    });
                }
            }
        }

        let session = self
            .store
            .apply_batch_outcome(&self.session_id, &outcome)
            .await
            .context("failed to apply batch outcome")?;
        debug!(
            batch = index,
            processed = outcome.processed,
            errors = outcome.error_count(),
            "batch applied"
        );
        Ok(session)
    }

    async fn process_one(
        &self,
        raw: &RawResult,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), ItemError> {
        let processed = derive_processed_result(&self.session_id, raw, now)?;
        let inserted = self
            .store
            .insert_processed_result(&processed)
            .await
            .map_err(|e| ItemError::Persist(format!("{:#}", e)))?;
        if inserted == InsertOutcome::AlreadyExists {
            debug!(raw_result_id = %raw.id, "duplicate detected: result already processed");
        }
        self.store
            .mark_raw_processed(&raw.id)
            .await
            .map_err(|e| ItemError::Persist(format!("{:#}", e)))?;
        Ok(())
    }
}

fn build_assignment(
    session_id: &str,
    detected: &DetectedGroup<'_, ProcessedResult>,
    now: DateTime<Utc>,
) -> GroupAssignment {
    let member_ids: Vec<String> = detected.members().map(|m| m.id.clone()).collect();
    GroupAssignment {
        group: DuplicateGroup {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            canonical_result_id: detected.canonical.id.clone(),
            canonical_url: detected.canonical.normalized_url.clone(),
            similarity_type: detected.similarity_type,
            confidence: detected.confidence,
            result_count: u32::try_from(member_ids.len()).unwrap_or(u32::MAX),
            sources: distinct_domains(detected.members()),
            created_at: now,
        },
        member_ids,
    }
}

/// Member domains in first-seen order, without repeats.
fn distinct_domains<'a>(members: impl Iterator<Item = &'a ProcessedResult>) -> Vec<String> {
    let mut domains: Vec<String> = Vec::new();
    for domain in members.filter_map(|m| url_domain(&m.normalized_url)) {
        if !domains.contains(&domain) {
            domains.push(domain);
        }
    }
    domains
}

async fn open_pipeline(config: &Config, progress: ProgressMode) -> anyhow::Result<Pipeline> {
    let pool = db::connect(config).await?;
    let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::new(pool));
    Ok(Pipeline::new(
        store,
        &config.pipeline,
        &config.dedup,
        progress.reporter(),
    ))
}

fn print_outcome(command: &str, session_id: &str, outcome: &RunOutcome) -> anyhow::Result<()> {
    match outcome {
        RunOutcome::Started(report) => {
            println!("{} {}", command, session_id);
            println!("  task: {}", report.task_id);
            println!("  status: {}", report.status);
            println!("  total: {}", report.total);
            println!("  processed: {}", report.processed);
            println!("  errors: {}", report.errors);
            println!("  duplicate groups: {}", report.duplicate_groups);
            println!("  duplicates: {}", report.duplicates);
            if let Some(stats) = &report.statistics {
                println!("  unique results: {}", stats.unique_results);
            }
            if let Some(failure) = &report.failure {
                anyhow::bail!("processing failed: {}", failure);
            }
        }
        RunOutcome::AlreadyCompleted => {
            println!("{} {}: already completed", command, session_id);
        }
        RunOutcome::NoResults => {
            println!("{} {}: no unprocessed results", command, session_id);
        }
        RunOutcome::Error(message) => anyhow::bail!("{}", message),
    }
    Ok(())
}

pub async fn run_process(
    config: &Config,
    session_id: &str,
    progress: ProgressMode,
) -> anyhow::Result<()> {
    let pipeline = open_pipeline(config, progress).await?;
    let outcome = pipeline.process_session_results(session_id).await;
    print_outcome("process", session_id, &outcome)
}

pub async fn run_retry(
    config: &Config,
    session_id: &str,
    progress: ProgressMode,
) -> anyhow::Result<()> {
    let pipeline = open_pipeline(config, progress).await?;
    let outcome = pipeline.retry_failed_processing(session_id).await;
    print_outcome("retry", session_id, &outcome)
}

pub async fn run_merge(config: &Config, group_id: &str) -> anyhow::Result<()> {
    let pipeline = open_pipeline(config, ProgressMode::Off).await?;
    let group = pipeline.merge_duplicate_group(group_id).await?;
    println!("merge {}", group.id);
    println!("  canonical: {}", group.canonical_result_id);
    println!("  url: {}", group.canonical_url);
    println!("  results: {}", group.result_count);
    println!("  sources: {}", group.sources.join(", "));
    Ok(())
}
