//! In-memory [`ResultStore`] implementation for tests and embedders.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Every method holds the
//! write locks it needs for its whole read-modify-write, so each call is
//! atomic like a SQL transaction. Locks are always taken in the order
//! raw → processed → groups → sessions.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{BatchOutcome, DuplicateGroup, ProcessedResult, RawResult};
use crate::session::{ProcessingSession, ProcessingStage, ProcessingStatus};

use super::{GroupAssignment, InsertOutcome, ResultStore};

struct SearchSession {
    _title: Option<String>,
    _created_at: DateTime<Utc>,
}

/// In-memory store for tests and embedding.
pub struct InMemoryStore {
    search_sessions: RwLock<HashMap<String, SearchSession>>,
    raw: RwLock<HashMap<String, RawResult>>,
    processed: RwLock<HashMap<String, ProcessedResult>>,
    groups: RwLock<HashMap<String, DuplicateGroup>>,
    sessions: RwLock<HashMap<String, ProcessingSession>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            search_sessions: RwLock::new(HashMap::new()),
            raw: RwLock::new(HashMap::new()),
            processed: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

fn sort_by_position(results: &mut [ProcessedResult]) {
    results.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
}

#[async_trait]
impl ResultStore for InMemoryStore {
    async fn register_search_session(&self, session_id: &str, title: Option<&str>) -> Result<()> {
        let mut sessions = self.search_sessions.write().map_err(poisoned)?;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SearchSession {
                _title: title.map(str::to_string),
                _created_at: Utc::now(),
            });
        Ok(())
    }

    async fn search_session_exists(&self, session_id: &str) -> Result<bool> {
        let sessions = self.search_sessions.read().map_err(poisoned)?;
        Ok(sessions.contains_key(session_id))
    }

    async fn insert_raw_results(&self, results: &[RawResult]) -> Result<usize> {
        let known = self.search_sessions.read().map_err(poisoned)?;
        if let Some(orphan) = results.iter().find(|r| !known.contains_key(&r.session_id)) {
            bail!("unknown search session: {}", orphan.session_id);
        }
        drop(known);

        let mut raw = self.raw.write().map_err(poisoned)?;
        let mut inserted = 0;
        for result in results {
            if raw.contains_key(&result.id) {
                continue;
            }
            raw.insert(result.id.clone(), result.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn raw_result_count(&self, session_id: &str) -> Result<u64> {
        let raw = self.raw.read().map_err(poisoned)?;
        Ok(raw.values().filter(|r| r.session_id == session_id).count() as u64)
    }

    async fn unprocessed_raw_result_ids(&self, session_id: &str) -> Result<Vec<String>> {
        let raw = self.raw.read().map_err(poisoned)?;
        let mut pending: Vec<&RawResult> = raw
            .values()
            .filter(|r| r.session_id == session_id && !r.is_processed)
            .collect();
        pending.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        Ok(pending.into_iter().map(|r| r.id.clone()).collect())
    }

    async fn raw_results_by_ids(&self, ids: &[String]) -> Result<Vec<RawResult>> {
        let raw = self.raw.read().map_err(poisoned)?;
        let mut found: Vec<RawResult> = ids.iter().filter_map(|id| raw.get(id).cloned()).collect();
        found.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn mark_raw_processed(&self, raw_id: &str) -> Result<()> {
        let mut raw = self.raw.write().map_err(poisoned)?;
        let result = raw
            .get_mut(raw_id)
            .ok_or_else(|| anyhow!("raw result not found: {}", raw_id))?;
        result.is_processed = true;
        result.processing_error = None;
        Ok(())
    }

    async fn mark_raw_failed(&self, raw_id: &str, error: &str) -> Result<()> {
        let mut raw = self.raw.write().map_err(poisoned)?;
        let result = raw
            .get_mut(raw_id)
            .ok_or_else(|| anyhow!("raw result not found: {}", raw_id))?;
        result.processing_error = Some(error.to_string());
        Ok(())
    }

    async fn insert_processed_result(&self, result: &ProcessedResult) -> Result<InsertOutcome> {
        let mut processed = self.processed.write().map_err(poisoned)?;
        let exists = processed.contains_key(&result.id)
            || (result.raw_result_id.is_some()
                && processed.values().any(|p| {
                    p.session_id == result.session_id && p.raw_result_id == result.raw_result_id
                }));
        if exists {
            return Ok(InsertOutcome::AlreadyExists);
        }
        processed.insert(result.id.clone(), result.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn processed_results(&self, session_id: &str) -> Result<Vec<ProcessedResult>> {
        let processed = self.processed.read().map_err(poisoned)?;
        let mut results: Vec<ProcessedResult> = processed
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        sort_by_position(&mut results);
        Ok(results)
    }

    async fn replace_duplicate_groups(
        &self,
        session_id: &str,
        assignments: &[GroupAssignment],
    ) -> Result<()> {
        let mut processed = self.processed.write().map_err(poisoned)?;
        let mut groups = self.groups.write().map_err(poisoned)?;

        // Validate before mutating anything.
        for assignment in assignments {
            if assignment.group.session_id != session_id {
                bail!(
                    "duplicate group {} belongs to session {}, not {}",
                    assignment.group.id,
                    assignment.group.session_id,
                    session_id
                );
            }
            for member in &assignment.member_ids {
                match processed.get(member) {
                    Some(p) if p.session_id == session_id => {}
                    _ => bail!("processed result not found in session: {}", member),
                }
            }
        }

        groups.retain(|_, g| g.session_id != session_id);
        for result in processed.values_mut().filter(|p| p.session_id == session_id) {
            result.duplicate_group_id = None;
        }
        for assignment in assignments {
            for member in &assignment.member_ids {
                if let Some(result) = processed.get_mut(member) {
                    result.duplicate_group_id = Some(assignment.group.id.clone());
                }
            }
            groups.insert(assignment.group.id.clone(), assignment.group.clone());
        }
        Ok(())
    }

    async fn duplicate_groups(&self, session_id: &str) -> Result<Vec<DuplicateGroup>> {
        let groups = self.groups.read().map_err(poisoned)?;
        let mut found: Vec<DuplicateGroup> = groups
            .values()
            .filter(|g| g.session_id == session_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn duplicate_group(&self, group_id: &str) -> Result<Option<DuplicateGroup>> {
        let groups = self.groups.read().map_err(poisoned)?;
        Ok(groups.get(group_id).cloned())
    }

    async fn group_members(&self, group_id: &str) -> Result<Vec<ProcessedResult>> {
        let processed = self.processed.read().map_err(poisoned)?;
        let mut members: Vec<ProcessedResult> = processed
            .values()
            .filter(|p| p.duplicate_group_id.as_deref() == Some(group_id))
            .cloned()
            .collect();
        sort_by_position(&mut members);
        Ok(members)
    }

    async fn update_duplicate_group(&self, group: &DuplicateGroup) -> Result<()> {
        let mut groups = self.groups.write().map_err(poisoned)?;
        let stored = groups
            .get_mut(&group.id)
            .ok_or_else(|| anyhow!("duplicate group not found: {}", group.id))?;
        *stored = group.clone();
        Ok(())
    }

    async fn processing_session(&self, session_id: &str) -> Result<Option<ProcessingSession>> {
        let sessions = self.sessions.read().map_err(poisoned)?;
        Ok(sessions.get(session_id).cloned())
    }

    async fn get_or_create_processing_session(
        &self,
        session_id: &str,
    ) -> Result<ProcessingSession> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        Ok(sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ProcessingSession::new(session_id))
            .clone())
    }

    async fn save_processing_session(&self, session: &ProcessingSession) -> Result<()> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn record_stage(
        &self,
        session_id: &str,
        stage: ProcessingStage,
        pct: u8,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("processing session not found: {}", session_id))?;
        session.current_stage = stage;
        session.stage_progress = pct.min(100);
        session.last_heartbeat = Some(Utc::now());
        Ok(())
    }

    async fn try_start_processing(
        &self,
        session_id: &str,
        total: u64,
        task_id: &str,
    ) -> Result<Option<ProcessingSession>> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(None);
        };
        if session.status != ProcessingStatus::Pending {
            return Ok(None);
        }
        session.start_processing(total, Some(task_id.to_string()))?;
        Ok(Some(session.clone()))
    }

    async fn apply_batch_outcome(
        &self,
        session_id: &str,
        outcome: &BatchOutcome,
    ) -> Result<ProcessingSession> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("processing session not found: {}", session_id))?;
        session.apply_batch(outcome);
        Ok(session.clone())
    }

    async fn reset_failed_session(&self, session_id: &str) -> Result<Option<ProcessingSession>> {
        let mut raw = self.raw.write().map_err(poisoned)?;
        let mut processed = self.processed.write().map_err(poisoned)?;
        let mut groups = self.groups.write().map_err(poisoned)?;
        let mut sessions = self.sessions.write().map_err(poisoned)?;

        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(None);
        };
        if session.status != ProcessingStatus::Failed {
            return Ok(None);
        }
        session.reset_for_retry()?;

        for result in raw.values_mut().filter(|r| r.session_id == session_id) {
            result.is_processed = false;
            result.processing_error = None;
        }
        processed.retain(|_, p| p.session_id != session_id);
        groups.retain(|_, g| g.session_id != session_id);
        Ok(Some(session.clone()))
    }
}
