//! Shared fixtures for pipeline tests: a fault-injecting store wrapper, a
//! collecting progress reporter, and raw result builders.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;

use greylit::config::{DedupConfig, PipelineConfig};
use greylit::pipeline::Pipeline;
use greylit::progress::{PipelineProgressEvent, ProgressReporter};
use greylit_core::models::{BatchOutcome, DuplicateGroup, ProcessedResult, RawResult};
use greylit_core::session::{ProcessingSession, ProcessingStage};
use greylit_core::store::{GroupAssignment, InsertOutcome, ResultStore};
use greylit_core::InMemoryStore;

/// Delegates to an [`InMemoryStore`], failing selected calls on demand.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryStore,
    /// `insert_processed_result` fails for these raw result ids.
    pub fail_insert_for: Mutex<HashSet<String>>,
    /// `apply_batch_outcome` fails while this is above zero.
    pub apply_failures: AtomicU32,
    pub fail_group_write: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_insert(&self, raw_id: &str) {
        self.fail_insert_for
            .lock()
            .unwrap()
            .insert(raw_id.to_string());
    }

    pub fn fail_next_applies(&self, n: u32) {
        self.apply_failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResultStore for FlakyStore {
    async fn register_search_session(&self, session_id: &str, title: Option<&str>) -> Result<()> {
        self.inner.register_search_session(session_id, title).await
    }

    async fn search_session_exists(&self, session_id: &str) -> Result<bool> {
        self.inner.search_session_exists(session_id).await
    }

    async fn insert_raw_results(&self, results: &[RawResult]) -> Result<usize> {
        self.inner.insert_raw_results(results).await
    }

    async fn raw_result_count(&self, session_id: &str) -> Result<u64> {
        self.inner.raw_result_count(session_id).await
    }

    async fn unprocessed_raw_result_ids(&self, session_id: &str) -> Result<Vec<String>> {
        self.inner.unprocessed_raw_result_ids(session_id).await
    }

    async fn raw_results_by_ids(&self, ids: &[String]) -> Result<Vec<RawResult>> {
        self.inner.raw_results_by_ids(ids).await
    }

    async fn mark_raw_processed(&self, raw_id: &str) -> Result<()> {
        self.inner.mark_raw_processed(raw_id).await
    }

    async fn mark_raw_failed(&self, raw_id: &str, error: &str) -> Result<()> {
        self.inner.mark_raw_failed(raw_id, error).await
    }

    async fn insert_processed_result(&self, result: &ProcessedResult) -> Result<InsertOutcome> {
        let failing = result
            .raw_result_id
            .as_ref()
            .is_some_and(|id| self.fail_insert_for.lock().unwrap().contains(id));
        if failing {
            bail!("disk I/O error");
        }
        self.inner.insert_processed_result(result).await
    }

    async fn processed_results(&self, session_id: &str) -> Result<Vec<ProcessedResult>> {
        self.inner.processed_results(session_id).await
    }

    async fn replace_duplicate_groups(
        &self,
        session_id: &str,
        assignments: &[GroupAssignment],
    ) -> Result<()> {
        if self.fail_group_write.load(Ordering::SeqCst) {
            bail!("database is locked");
        }
        self.inner
            .replace_duplicate_groups(session_id, assignments)
            .await
    }

    async fn duplicate_groups(&self, session_id: &str) -> Result<Vec<DuplicateGroup>> {
        self.inner.duplicate_groups(session_id).await
    }

    async fn duplicate_group(&self, group_id: &str) -> Result<Option<DuplicateGroup>> {
        self.inner.duplicate_group(group_id).await
    }

    async fn group_members(&self, group_id: &str) -> Result<Vec<ProcessedResult>> {
        self.inner.group_members(group_id).await
    }

    async fn update_duplicate_group(&self, group: &DuplicateGroup) -> Result<()> {
        self.inner.update_duplicate_group(group).await
    }

    async fn processing_session(&self, session_id: &str) -> Result<Option<ProcessingSession>> {
        self.inner.processing_session(session_id).await
    }

    async fn get_or_create_processing_session(
        &self,
        session_id: &str,
    ) -> Result<ProcessingSession> {
        self.inner.get_or_create_processing_session(session_id).await
    }

    async fn save_processing_session(&self, session: &ProcessingSession) -> Result<()> {
        self.inner.save_processing_session(session).await
    }

    async fn record_stage(
        &self,
        session_id: &str,
        stage: ProcessingStage,
        pct: u8,
    ) -> Result<()> {
        self.inner.record_stage(session_id, stage, pct).await
    }

    async fn try_start_processing(
        &self,
        session_id: &str,
        total: u64,
        task_id: &str,
    ) -> Result<Option<ProcessingSession>> {
        self.inner
            .try_start_processing(session_id, total, task_id)
            .await
    }

    async fn apply_batch_outcome(
        &self,
        session_id: &str,
        outcome: &BatchOutcome,
    ) -> Result<ProcessingSession> {
        let remaining = self.apply_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.apply_failures.store(remaining - 1, Ordering::SeqCst);
            bail!("database is locked");
        }
        self.inner.apply_batch_outcome(session_id, outcome).await
    }

    async fn reset_failed_session(&self, session_id: &str) -> Result<Option<ProcessingSession>> {
        self.inner.reset_failed_session(session_id).await
    }
}

/// Records every progress event for later assertions.
#[derive(Default)]
pub struct CollectingProgress {
    pub events: Mutex<Vec<PipelineProgressEvent>>,
}

impl CollectingProgress {
    pub fn events(&self) -> Vec<PipelineProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressReporter for CollectingProgress {
    fn report(&self, event: PipelineProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn raw(session_id: &str, id: &str, position: i64, title: &str, link: &str) -> RawResult {
    RawResult {
        id: id.to_string(),
        session_id: session_id.to_string(),
        position,
        title: title.to_string(),
        link: link.to_string(),
        snippet: String::new(),
        detected_date: None,
        has_pdf: false,
        is_processed: false,
        processing_error: None,
    }
}

/// `n` unrelated results on distinct domains.
pub fn distinct_results(session_id: &str, n: usize) -> Vec<RawResult> {
    const TOPICS: [&str; 12] = [
        "Telehealth adoption in rural clinics",
        "Nurse staffing ratios in urban hospitals",
        "Coastal flood defence funding",
        "School meal programme evaluation",
        "Groundwater contamination survey",
        "Microfinance outcomes for women",
        "Road safety camera effectiveness",
        "Library digitisation strategy",
        "Youth unemployment interventions",
        "Wildfire smoke exposure guidance",
        "Public transit fare subsidies",
        "Antibiotic stewardship audit",
    ];
    (0..n)
        .map(|i| {
            raw(
                session_id,
                &format!("r{}", i),
                i as i64,
                TOPICS[i % TOPICS.len()],
                &format!("https://site{}.example.org/report/{}", i, i),
            )
        })
        .collect()
}

pub fn fast_config(batch_size: usize, max_retries: u32) -> PipelineConfig {
    PipelineConfig {
        batch_size,
        max_concurrent_batches: 2,
        max_retries,
        retry_base_delay_ms: 1,
    }
}

pub fn pipeline(
    store: Arc<dyn ResultStore>,
    config: &PipelineConfig,
    progress: Arc<CollectingProgress>,
) -> Pipeline {
    Pipeline::new(store, config, &DedupConfig::default(), progress)
}

pub async fn seed(store: &dyn ResultStore, session_id: &str, results: &[RawResult]) {
    store
        .register_search_session(session_id, Some("Test review"))
        .await
        .unwrap();
    store.insert_raw_results(results).await.unwrap();
}
