//! Raw result ingestion.
//!
//! Loads a JSON array of search-engine results into a search session:
//!
//! ```json
//! [
//!   { "title": "Rural clinic report", "link": "https://example.org/r.pdf",
//!     "snippet": "...", "date": "2021-03-01", "has_pdf": true }
//! ]
//! ```
//!
//! Field names follow the Serper response shape; `detected_date` and
//! `hasPdf` are accepted as aliases. Records without an `id` get a UUID.
//! Positions continue after the results already stored for the session, so
//! repeated ingests append. Blank titles and broken links are stored as-is:
//! the pipeline records them as per-result errors.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use greylit_core::models::RawResult;
use greylit_core::store::ResultStore;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// One search-engine result as it appears in an ingest file.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default, alias = "detected_date")]
    pub date: Option<String>,
    #[serde(default, alias = "hasPdf")]
    pub has_pdf: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub received: usize,
    pub inserted: usize,
}

pub fn parse_records(json: &str) -> Result<Vec<IngestRecord>> {
    serde_json::from_str(json).context("ingest file must be a JSON array of results")
}

/// Turn records into raw results for `session_id`, numbering positions from
/// `first_position`.
pub fn to_raw_results(
    session_id: &str,
    records: Vec<IngestRecord>,
    first_position: i64,
) -> Vec<RawResult> {
    records
        .into_iter()
        .zip(first_position..)
        .map(|(record, position)| RawResult {
            id: record
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            session_id: session_id.to_string(),
            position,
            title: record.title,
            link: record.link,
            snippet: record.snippet.unwrap_or_default(),
            detected_date: record.date.filter(|d| !d.trim().is_empty()),
            has_pdf: record.has_pdf,
            is_processed: false,
            processing_error: None,
        })
        .collect()
}

/// Register the search session (if new) and store the records.
pub async fn ingest_records(
    store: &dyn ResultStore,
    session_id: &str,
    title: Option<&str>,
    records: Vec<IngestRecord>,
) -> Result<IngestReport> {
    store.register_search_session(session_id, title).await?;
    let received = records.len();
    let existing = store.raw_result_count(session_id).await?;
    let raws = to_raw_results(session_id, records, existing as i64);
    let inserted = store.insert_raw_results(&raws).await?;
    info!(session_id, received, inserted, "raw results ingested");
    Ok(IngestReport { received, inserted })
}

pub async fn run_ingest(
    config: &Config,
    session_id: &str,
    file: &Path,
    title: Option<&str>,
) -> Result<()> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read ingest file: {}", file.display()))?;
    let records = parse_records(&json)?;

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let report = ingest_records(&store, session_id, title, records).await?;

    println!("ingest {}", session_id);
    println!("  received: {}", report.received);
    println!("  inserted: {}", report.inserted);
    if report.inserted < report.received {
        println!(
            "  skipped:  {} (ids already present)",
            report.received - report.inserted
        );
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use greylit_core::InMemoryStore;

    #[test]
    fn parses_serper_fields_and_aliases() {
        let records = parse_records(
            r#"[
                {"title": "A", "link": "https://a.org", "snippet": "s", "date": "2020", "has_pdf": true},
                {"id": "r2", "title": "B", "link": "https://b.org", "detected_date": "2019", "hasPdf": false},
                {"link": "https://c.org"}
            ]"#,
        )
        .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].date.as_deref(), Some("2020"));
        assert!(records[0].has_pdf);
        assert_eq!(records[1].id.as_deref(), Some("r2"));
        assert_eq!(records[1].date.as_deref(), Some("2019"));
        assert_eq!(records[2].title, "");
        assert!(records[2].snippet.is_none());
    }

    #[test]
    fn rejects_non_array() {
        assert!(parse_records(r#"{"title": "A"}"#).is_err());
    }

    #[test]
    fn assigns_ids_and_positions() {
        let records = parse_records(
            r#"[{"id": "keep", "title": "A", "link": "x"}, {"id": " ", "title": "B", "link": "y"}]"#,
        )
        .unwrap();
        let raws = to_raw_results("s1", records, 7);
        assert_eq!(raws[0].id, "keep");
        assert_eq!(raws[0].position, 7);
        assert_ne!(raws[1].id.trim(), "");
        assert_eq!(raws[1].position, 8);
        assert!(raws.iter().all(|r| !r.is_processed && r.session_id == "s1"));
    }

    #[tokio::test]
    async fn repeated_ingest_appends_and_skips_known_ids() {
        let store = InMemoryStore::new();
        let first = parse_records(
            r#"[{"id": "r1", "title": "A", "link": "https://a.org"},
                {"id": "r2", "title": "B", "link": "https://b.org"}]"#,
        )
        .unwrap();
        let report = ingest_records(&store, "s1", Some("Review"), first)
            .await
            .unwrap();
        assert_eq!(report, IngestReport { received: 2, inserted: 2 });

        let second = parse_records(
            r#"[{"id": "r2", "title": "B", "link": "https://b.org"},
                {"id": "r3", "title": "C", "link": "https://c.org"}]"#,
        )
        .unwrap();
        let report = ingest_records(&store, "s1", None, second).await.unwrap();
        assert_eq!(report, IngestReport { received: 2, inserted: 1 });
        assert_eq!(store.raw_result_count("s1").await.unwrap(), 3);

        let raws = store
            .raw_results_by_ids(&["r3".to_string()])
            .await
            .unwrap();
        assert_eq!(raws[0].position, 3);
    }
}
