//! SQLite-backed [`ResultStore`] implementation.
//!
//! Timestamps are stored as Unix milliseconds. Operations that touch more
//! than one row run in a transaction. Every read-modify-write on a
//! processing session starts with its `UPDATE`, so the transaction holds
//! SQLite's write lock before it reads anything back. Status transitions
//! that must not race ([`try_start_processing`], [`reset_failed_session`])
//! put the expected status in the `WHERE` clause and check
//! `rows_affected`.
//!
//! [`try_start_processing`]: ResultStore::try_start_processing
//! [`reset_failed_session`]: ResultStore::reset_failed_session

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use greylit_core::models::{BatchOutcome, DuplicateGroup, ProcessedResult, RawResult};
use greylit_core::session::{ErrorDetail, ProcessingSession, ProcessingStage, ProcessingStatus};
use greylit_core::store::{GroupAssignment, InsertOutcome, ResultStore};

const RAW_COLUMNS: &str = "id, session_id, position, title, link, snippet, detected_date, \
    has_pdf, is_processed, processing_error";

const PROCESSED_COLUMNS: &str = "id, session_id, raw_result_id, title, normalized_url, snippet, \
    publication_year, document_type, is_pdf, relevance_score, duplicate_group_id, is_reviewed, \
    review_priority, position, processed_at";

const GROUP_COLUMNS: &str = "id, session_id, canonical_result_id, canonical_url, similarity_type, \
    confidence, result_count, sources_json, created_at";

const SESSION_COLUMNS: &str = "session_id, status, current_stage, stage_progress, \
    total_raw_results, processed_count, error_count, duplicate_count, retry_count, task_id, \
    started_at, completed_at, last_heartbeat";

/// Keeps `IN (...)` lists well under SQLite's bound-parameter limit.
const ID_CHUNK: usize = 500;

/// SQLite implementation of the [`ResultStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

fn count(value: i64) -> u64 {
    value.max(0) as u64
}

fn raw_from_row(row: &SqliteRow) -> RawResult {
    RawResult {
        id: row.get("id"),
        session_id: row.get("session_id"),
        position: row.get("position"),
        title: row.get("title"),
        link: row.get("link"),
        snippet: row.get("snippet"),
        detected_date: row.get("detected_date"),
        has_pdf: row.get("has_pdf"),
        is_processed: row.get("is_processed"),
        processing_error: row.get("processing_error"),
    }
}

fn processed_from_row(row: &SqliteRow) -> Result<ProcessedResult> {
    let document_type: String = row.get("document_type");
    Ok(ProcessedResult {
        id: row.get("id"),
        session_id: row.get("session_id"),
        raw_result_id: row.get("raw_result_id"),
        title: row.get("title"),
        normalized_url: row.get("normalized_url"),
        snippet: row.get("snippet"),
        publication_year: row.get("publication_year"),
        document_type: document_type.parse()?,
        is_pdf: row.get("is_pdf"),
        relevance_score: row.get("relevance_score"),
        duplicate_group_id: row.get("duplicate_group_id"),
        is_reviewed: row.get("is_reviewed"),
        review_priority: row.get("review_priority"),
        position: row.get("position"),
        processed_at: from_millis(row.get("processed_at"))?,
    })
}

fn group_from_row(row: &SqliteRow) -> Result<DuplicateGroup> {
    let similarity_type: String = row.get("similarity_type");
    let sources_json: String = row.get("sources_json");
    let result_count: i64 = row.get("result_count");
    let id: String = row.get("id");
    let sources = serde_json::from_str(&sources_json)
        .with_context(|| format!("invalid sources for duplicate group {}", id))?;
    Ok(DuplicateGroup {
        id,
        session_id: row.get("session_id"),
        canonical_result_id: row.get("canonical_result_id"),
        canonical_url: row.get("canonical_url"),
        similarity_type: similarity_type.parse()?,
        confidence: row.get("confidence"),
        result_count: u32::try_from(result_count.max(0)).unwrap_or(u32::MAX),
        sources,
        created_at: from_millis(row.get("created_at"))?,
    })
}

fn session_from_row(row: &SqliteRow, error_details: Vec<ErrorDetail>) -> Result<ProcessingSession> {
    let status: String = row.get("status");
    let stage: String = row.get("current_stage");
    let stage_progress: i64 = row.get("stage_progress");
    let retry_count: i64 = row.get("retry_count");
    Ok(ProcessingSession {
        session_id: row.get("session_id"),
        status: status.parse()?,
        current_stage: stage.parse()?,
        stage_progress: stage_progress.clamp(0, 100) as u8,
        total_raw_results: count(row.get("total_raw_results")),
        processed_count: count(row.get("processed_count")),
        error_count: count(row.get("error_count")),
        duplicate_count: count(row.get("duplicate_count")),
        retry_count: u32::try_from(retry_count.max(0)).unwrap_or(u32::MAX),
        task_id: row.get("task_id"),
        error_details,
        started_at: opt_from_millis(row.get("started_at"))?,
        completed_at: opt_from_millis(row.get("completed_at"))?,
        last_heartbeat: opt_from_millis(row.get("last_heartbeat"))?,
    })
}

/// Load a processing session and its error log on one connection, so the
/// read sees the same snapshot as an enclosing transaction.
async fn fetch_session(
    conn: &mut SqliteConnection,
    session_id: &str,
) -> Result<Option<ProcessingSession>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM processing_sessions WHERE session_id = ?",
        SESSION_COLUMNS
    ))
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await?;

    let row = match row {
        Some(row) => row,
        None => return Ok(None),
    };

    let error_rows = sqlx::query(
        "SELECT timestamp, message, details FROM processing_errors WHERE session_id = ? ORDER BY id ASC",
    )
    .bind(session_id)
    .fetch_all(&mut *conn)
    .await?;

    let error_details = error_rows
        .iter()
        .map(|r| {
            Ok(ErrorDetail {
                timestamp: from_millis(r.get("timestamp"))?,
                message: r.get("message"),
                details: r.get("details"),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(session_from_row(&row, error_details)?))
}

async fn insert_error(
    conn: &mut SqliteConnection,
    session_id: &str,
    detail: &ErrorDetail,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO processing_errors (session_id, timestamp, message, details) VALUES (?, ?, ?, ?)",
    )
    .bind(session_id)
    .bind(to_millis(detail.timestamp))
    .bind(&detail.message)
    .bind(&detail.details)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn register_search_session(&self, session_id: &str, title: Option<&str>) -> Result<()> {
        sqlx::query(
            "INSERT INTO search_sessions (id, title, created_at) VALUES (?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(session_id)
        .bind(title)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn search_session_exists(&self, session_id: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM search_sessions WHERE id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn insert_raw_results(&self, results: &[RawResult]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for result in results {
            let known: bool =
                sqlx::query_scalar("SELECT COUNT(*) > 0 FROM search_sessions WHERE id = ?")
                    .bind(&result.session_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if !known {
                bail!("unknown search session: {}", result.session_id);
            }

            let outcome = sqlx::query(&format!(
                "INSERT INTO raw_results ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
                RAW_COLUMNS
            ))
            .bind(&result.id)
            .bind(&result.session_id)
            .bind(result.position)
            .bind(&result.title)
            .bind(&result.link)
            .bind(&result.snippet)
            .bind(&result.detected_date)
            .bind(result.has_pdf)
            .bind(result.is_processed)
            .bind(&result.processing_error)
            .execute(&mut *tx)
            .await?;
            inserted += outcome.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn raw_result_count(&self, session_id: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_results WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count(n))
    }

    async fn unprocessed_raw_result_ids(&self, session_id: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM raw_results WHERE session_id = ? AND is_processed = 0 ORDER BY position ASC, id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn raw_results_by_ids(&self, ids: &[String]) -> Result<Vec<RawResult>> {
        let mut found = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM raw_results WHERE id IN ({})",
                RAW_COLUMNS, placeholders
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            let rows = query.fetch_all(&self.pool).await?;
            found.extend(rows.iter().map(raw_from_row));
        }
        found.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn mark_raw_processed(&self, raw_id: &str) -> Result<()> {
        let outcome = sqlx::query(
            "UPDATE raw_results SET is_processed = 1, processing_error = NULL WHERE id = ?",
        )
        .bind(raw_id)
        .execute(&self.pool)
        .await?;
        if outcome.rows_affected() == 0 {
            bail!("raw result not found: {}", raw_id);
        }
        Ok(())
    }

    async fn mark_raw_failed(&self, raw_id: &str, error: &str) -> Result<()> {
        let outcome = sqlx::query("UPDATE raw_results SET processing_error = ? WHERE id = ?")
            .bind(error)
            .bind(raw_id)
            .execute(&self.pool)
            .await?;
        if outcome.rows_affected() == 0 {
            bail!("raw result not found: {}", raw_id);
        }
        Ok(())
    }

    async fn insert_processed_result(&self, result: &ProcessedResult) -> Result<InsertOutcome> {
        let outcome = sqlx::query(&format!(
            "INSERT INTO processed_results ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
            PROCESSED_COLUMNS
        ))
        .bind(&result.id)
        .bind(&result.session_id)
        .bind(&result.raw_result_id)
        .bind(&result.title)
        .bind(&result.normalized_url)
        .bind(&result.snippet)
        .bind(result.publication_year)
        .bind(result.document_type.as_str())
        .bind(result.is_pdf)
        .bind(result.relevance_score)
        .bind(&result.duplicate_group_id)
        .bind(result.is_reviewed)
        .bind(result.review_priority)
        .bind(result.position)
        .bind(to_millis(result.processed_at))
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            Ok(InsertOutcome::AlreadyExists)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn processed_results(&self, session_id: &str) -> Result<Vec<ProcessedResult>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM processed_results WHERE session_id = ? ORDER BY position ASC, id ASC",
            PROCESSED_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(processed_from_row).collect()
    }

    async fn replace_duplicate_groups(
        &self,
        session_id: &str,
        assignments: &[GroupAssignment],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE processed_results SET duplicate_group_id = NULL WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM duplicate_groups WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        for assignment in assignments {
            let group = &assignment.group;
            if group.session_id != session_id {
                bail!(
                    "duplicate group {} belongs to session {}, not {}",
                    group.id,
                    group.session_id,
                    session_id
                );
            }

            sqlx::query(&format!(
                "INSERT INTO duplicate_groups ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                GROUP_COLUMNS
            ))
            .bind(&group.id)
            .bind(&group.session_id)
            .bind(&group.canonical_result_id)
            .bind(&group.canonical_url)
            .bind(group.similarity_type.as_str())
            .bind(group.confidence)
            .bind(i64::from(group.result_count))
            .bind(serde_json::to_string(&group.sources)?)
            .bind(to_millis(group.created_at))
            .execute(&mut *tx)
            .await?;

            for member in &assignment.member_ids {
                let outcome = sqlx::query(
                    "UPDATE processed_results SET duplicate_group_id = ? WHERE id = ? AND session_id = ?",
                )
                .bind(&group.id)
                .bind(member)
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
                if outcome.rows_affected() == 0 {
                    bail!("processed result not found in session: {}", member);
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn duplicate_groups(&self, session_id: &str) -> Result<Vec<DuplicateGroup>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM duplicate_groups WHERE session_id = ? ORDER BY created_at ASC, id ASC",
            GROUP_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(group_from_row).collect()
    }

    async fn duplicate_group(&self, group_id: &str) -> Result<Option<DuplicateGroup>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM duplicate_groups WHERE id = ?",
            GROUP_COLUMNS
        ))
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(group_from_row).transpose()
    }

    async fn group_members(&self, group_id: &str) -> Result<Vec<ProcessedResult>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM processed_results WHERE duplicate_group_id = ? ORDER BY position ASC, id ASC",
            PROCESSED_COLUMNS
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(processed_from_row).collect()
    }

    async fn update_duplicate_group(&self, group: &DuplicateGroup) -> Result<()> {
        let outcome = sqlx::query(
            r#"
            UPDATE duplicate_groups SET
                canonical_result_id = ?,
                canonical_url = ?,
                similarity_type = ?,
                confidence = ?,
                result_count = ?,
                sources_json = ?
            WHERE id = ?
            "#,
        )
        .bind(&group.canonical_result_id)
        .bind(&group.canonical_url)
        .bind(group.similarity_type.as_str())
        .bind(group.confidence)
        .bind(i64::from(group.result_count))
        .bind(serde_json::to_string(&group.sources)?)
        .bind(&group.id)
        .execute(&self.pool)
        .await?;
        if outcome.rows_affected() == 0 {
            bail!("duplicate group not found: {}", group.id);
        }
        Ok(())
    }

    async fn processing_session(&self, session_id: &str) -> Result<Option<ProcessingSession>> {
        let mut conn = self.pool.acquire().await?;
        fetch_session(&mut conn, session_id).await
    }

    async fn get_or_create_processing_session(
        &self,
        session_id: &str,
    ) -> Result<ProcessingSession> {
        let fresh = ProcessingSession::new(session_id);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO processing_sessions (session_id, status, current_stage)
            VALUES (?, ?, ?)
            ON CONFLICT(session_id) DO NOTHING
            "#,
        )
        .bind(session_id)
        .bind(fresh.status.as_str())
        .bind(fresh.current_stage.as_str())
        .execute(&mut *tx)
        .await?;

        let session = fetch_session(&mut tx, session_id)
            .await?
            .ok_or_else(|| anyhow!("processing session not found: {}", session_id))?;
        tx.commit().await?;
        Ok(session)
    }

    async fn save_processing_session(&self, session: &ProcessingSession) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            r#"
            INSERT INTO processing_sessions ({})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                status = excluded.status,
                current_stage = excluded.current_stage,
                stage_progress = excluded.stage_progress,
                total_raw_results = excluded.total_raw_results,
                processed_count = excluded.processed_count,
                error_count = excluded.error_count,
                duplicate_count = excluded.duplicate_count,
                retry_count = excluded.retry_count,
                task_id = excluded.task_id,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                last_heartbeat = excluded.last_heartbeat
            "#,
            SESSION_COLUMNS
        ))
        .bind(&session.session_id)
        .bind(session.status.as_str())
        .bind(session.current_stage.as_str())
        .bind(i64::from(session.stage_progress))
        .bind(session.total_raw_results as i64)
        .bind(session.processed_count as i64)
        .bind(session.error_count as i64)
        .bind(session.duplicate_count as i64)
        .bind(i64::from(session.retry_count))
        .bind(&session.task_id)
        .bind(session.started_at.map(to_millis))
        .bind(session.completed_at.map(to_millis))
        .bind(session.last_heartbeat.map(to_millis))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM processing_errors WHERE session_id = ?")
            .bind(&session.session_id)
            .execute(&mut *tx)
            .await?;
        for detail in &session.error_details {
            insert_error(&mut tx, &session.session_id, detail).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn record_stage(
        &self,
        session_id: &str,
        stage: ProcessingStage,
        pct: u8,
    ) -> Result<()> {
        let outcome = sqlx::query(
            "UPDATE processing_sessions SET current_stage = ?, stage_progress = ?, last_heartbeat = ? WHERE session_id = ?",
        )
        .bind(stage.as_str())
        .bind(i64::from(pct.min(100)))
        .bind(to_millis(Utc::now()))
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        if outcome.rows_affected() == 0 {
            bail!("processing session not found: {}", session_id);
        }
        Ok(())
    }

    async fn try_start_processing(
        &self,
        session_id: &str,
        total: u64,
        task_id: &str,
    ) -> Result<Option<ProcessingSession>> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE processing_sessions SET
                status = ?,
                current_stage = ?,
                stage_progress = 0,
                total_raw_results = ?,
                processed_count = 0,
                error_count = 0,
                duplicate_count = 0,
                task_id = ?,
                started_at = ?,
                completed_at = NULL,
                last_heartbeat = ?
            WHERE session_id = ? AND status = ?
            "#,
        )
        .bind(ProcessingStatus::InProgress.as_str())
        .bind(ProcessingStage::Initialization.as_str())
        .bind(total as i64)
        .bind(task_id)
        .bind(now)
        .bind(now)
        .bind(session_id)
        .bind(ProcessingStatus::Pending.as_str())
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            return Ok(None);
        }

        sqlx::query("DELETE FROM processing_errors WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        let session = fetch_session(&mut tx, session_id).await?;
        tx.commit().await?;
        Ok(session)
    }

    async fn apply_batch_outcome(
        &self,
        session_id: &str,
        outcome: &BatchOutcome,
    ) -> Result<ProcessingSession> {
        let mut tx = self.pool.begin().await?;

        // Write first: the transaction takes the write lock before any read.
        let updated = sqlx::query(
            r#"
            UPDATE processing_sessions SET
                processed_count = processed_count + ?,
                error_count = error_count + ?,
                last_heartbeat = ?
            WHERE session_id = ?
            "#,
        )
        .bind(outcome.processed as i64)
        .bind(outcome.error_count() as i64)
        .bind(to_millis(Utc::now()))
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            bail!("processing session not found: {}", session_id);
        }

        for failure in &outcome.failures {
            insert_error(&mut tx, session_id, &ErrorDetail::item_failure(failure)).await?;
        }

        let session = fetch_session(&mut tx, session_id)
            .await?
            .ok_or_else(|| anyhow!("processing session not found: {}", session_id))?;
        tx.commit().await?;
        Ok(session)
    }

    async fn reset_failed_session(&self, session_id: &str) -> Result<Option<ProcessingSession>> {
        let mut tx = self.pool.begin().await?;

        let reset = sqlx::query(
            r#"
            UPDATE processing_sessions SET
                status = ?,
                current_stage = ?,
                stage_progress = 0,
                total_raw_results = 0,
                processed_count = 0,
                error_count = 0,
                duplicate_count = 0,
                retry_count = retry_count + 1,
                task_id = NULL,
                started_at = NULL,
                completed_at = NULL,
                last_heartbeat = NULL
            WHERE session_id = ? AND status = ?
            "#,
        )
        .bind(ProcessingStatus::Pending.as_str())
        .bind(ProcessingStage::Initialization.as_str())
        .bind(session_id)
        .bind(ProcessingStatus::Failed.as_str())
        .execute(&mut *tx)
        .await?;
        if reset.rows_affected() == 0 {
            return Ok(None);
        }

        sqlx::query("DELETE FROM processing_errors WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM processed_results WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM duplicate_groups WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE raw_results SET is_processed = 0, processing_error = NULL WHERE session_id = ?",
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        let session = fetch_session(&mut tx, session_id).await?;
        tx.commit().await?;
        Ok(session)
    }
}
