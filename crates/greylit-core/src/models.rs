//! Core data models used throughout greylit.
//!
//! These types represent the raw search results, the normalized results
//! derived from them, and the duplicate groups that flow through the
//! processing pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An unprocessed record returned by a search-engine API call.
///
/// Content is immutable once ingested; the pipeline only writes back
/// `is_processed` and `processing_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    pub id: String,
    pub session_id: String,
    /// Rank of the result within its search session (ingestion order).
    pub position: i64,
    pub title: String,
    pub link: String,
    pub snippet: String,
    pub detected_date: Option<String>,
    pub has_pdf: bool,
    pub is_processed: bool,
    pub processing_error: Option<String>,
}

/// Coarse document type derived from the URL and the PDF flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Pdf,
    Webpage,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Pdf => "pdf",
            DocumentType::Webpage => "webpage",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pdf" => Ok(DocumentType::Pdf),
            "webpage" => Ok(DocumentType::Webpage),
            other => anyhow::bail!("unknown document type: '{}'", other),
        }
    }
}

/// Normalized, deduplication-eligible record derived from exactly one
/// [`RawResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedResult {
    pub id: String,
    pub session_id: String,
    /// Nullable: the raw result may be deleted independently.
    pub raw_result_id: Option<String>,
    pub title: String,
    pub normalized_url: String,
    pub snippet: String,
    pub publication_year: Option<i32>,
    pub document_type: DocumentType,
    pub is_pdf: bool,
    pub relevance_score: Option<f64>,
    pub duplicate_group_id: Option<String>,
    pub is_reviewed: bool,
    pub review_priority: i32,
    pub position: i64,
    pub processed_at: DateTime<Utc>,
}

/// How the members of a duplicate group were judged to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityType {
    ExactUrl,
    NormalizedUrl,
    TitleMatch,
    ContentHash,
    FuzzyMatch,
}

impl SimilarityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimilarityType::ExactUrl => "exact_url",
            SimilarityType::NormalizedUrl => "normalized_url",
            SimilarityType::TitleMatch => "title_match",
            SimilarityType::ContentHash => "content_hash",
            SimilarityType::FuzzyMatch => "fuzzy_match",
        }
    }
}

impl fmt::Display for SimilarityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SimilarityType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "exact_url" => Ok(SimilarityType::ExactUrl),
            "normalized_url" => Ok(SimilarityType::NormalizedUrl),
            "title_match" => Ok(SimilarityType::TitleMatch),
            "content_hash" => Ok(SimilarityType::ContentHash),
            "fuzzy_match" => Ok(SimilarityType::FuzzyMatch),
            other => anyhow::bail!("unknown similarity type: '{}'", other),
        }
    }
}

/// A cluster of processed results judged to represent the same source.
///
/// `result_count` counts every member, the canonical one included, and
/// every member (canonical included) carries `duplicate_group_id == id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: String,
    pub session_id: String,
    pub canonical_result_id: String,
    pub canonical_url: String,
    pub similarity_type: SimilarityType,
    pub confidence: f64,
    pub result_count: u32,
    /// Distinct domains of the member results.
    pub sources: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl DuplicateGroup {
    /// Number of non-canonical members.
    pub fn duplicate_count(&self) -> u64 {
        u64::from(self.result_count.saturating_sub(1))
    }
}

/// A raw result that could not be turned into a processed result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub raw_result_id: String,
    pub message: String,
}

/// What one batch attempt achieved; applied to the processing session in a
/// single atomic update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batch_index: usize,
    pub processed: u64,
    pub failures: Vec<ItemFailure>,
}

impl BatchOutcome {
    pub fn new(batch_index: usize) -> Self {
        Self {
            batch_index,
            ..Default::default()
        }
    }

    pub fn error_count(&self) -> u64 {
        self.failures.len() as u64
    }
}
