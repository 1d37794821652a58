//! Metadata extraction for raw search results.
//!
//! Turns a [`RawResult`] into a [`ProcessedResult`]: URL normalization,
//! document-type classification, publication-year extraction, and a simple
//! relevance heuristic used to order the review queue.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use url::Url;
use uuid::Uuid;

use crate::error::ItemError;
use crate::models::{DocumentType, ProcessedResult, RawResult};
use crate::similarity::{normalize_url, url_domain};

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").expect("year pattern is valid"));

/// Hosts of scholarly publishers, indexes and repositories.
const ACADEMIC_HOSTS: &[&str] = &[
    "arxiv.org",
    "ncbi.nlm.nih.gov",
    "pubmed.ncbi.nlm.nih.gov",
    "doi.org",
    "researchgate.net",
    "ssrn.com",
    "jstor.org",
    "springer.com",
    "link.springer.com",
    "sciencedirect.com",
    "onlinelibrary.wiley.com",
    "wiley.com",
    "tandfonline.com",
    "scholar.google.com",
    "semanticscholar.org",
    "europepmc.org",
];

const RECENT_YEARS: i32 = 10;
const LONG_SNIPPET_CHARS: usize = 100;

/// `pdf` if the search engine flagged a PDF or the URL path ends in `.pdf`.
pub fn classify_document_type(url: &str, has_pdf: bool) -> DocumentType {
    if has_pdf {
        return DocumentType::Pdf;
    }
    let normalized = normalize_url(url);
    let path = Url::parse(&normalized)
        .map(|u| u.path().to_string())
        .unwrap_or(normalized);
    if path.ends_with(".pdf") {
        DocumentType::Pdf
    } else {
        DocumentType::Webpage
    }
}

/// First plausible four-digit year found in the detected date, then the
/// title, then the snippet. Years after `current_year + 1` are ignored.
pub fn extract_publication_year(
    detected_date: Option<&str>,
    title: &str,
    snippet: &str,
    current_year: i32,
) -> Option<i32> {
    [detected_date.unwrap_or_default(), title, snippet]
        .iter()
        .find_map(|text| {
            YEAR_RE
                .captures_iter(text)
                .filter_map(|caps| caps[1].parse::<i32>().ok())
                .find(|year| (1900..=current_year + 1).contains(year))
        })
}

/// Whether a host belongs to a university or a scholarly publisher.
pub fn is_academic_domain(host: &str) -> bool {
    let host = host.trim_start_matches("www.");
    if host.ends_with(".edu") || host.contains(".edu.") || host.contains(".ac.") {
        return true;
    }
    ACADEMIC_HOSTS
        .iter()
        .any(|known| host == *known || host.ends_with(&format!(".{}", known)))
}

/// Relevance heuristic in `[0, 1]`.
///
/// Starts at 0.5; full text adds 0.2, an academic host 0.15, a publication
/// year within the last ten years 0.1, and a snippet of 100+ characters 0.05.
pub fn score_relevance(
    is_pdf: bool,
    academic: bool,
    publication_year: Option<i32>,
    snippet: &str,
    current_year: i32,
) -> f64 {
    let mut score = 0.5;
    if is_pdf {
        score += 0.2;
    }
    if academic {
        score += 0.15;
    }
    if publication_year.is_some_and(|year| current_year - year <= RECENT_YEARS) {
        score += 0.1;
    }
    if snippet.chars().count() >= LONG_SNIPPET_CHARS {
        score += 0.05;
    }
    f64::min(score, 1.0)
}

/// Review priority derived from a relevance score; higher is reviewed first.
pub fn review_priority(relevance: f64) -> i32 {
    (relevance.clamp(0.0, 1.0) * 100.0).round() as i32
}

/// Build the processed form of a raw result.
///
/// Fails with [`ItemError`] when the title is blank or the link is not an
/// absolute URL with a host.
pub fn derive_processed_result(
    session_id: &str,
    raw: &RawResult,
    now: DateTime<Utc>,
) -> Result<ProcessedResult, ItemError> {
    let title = raw.title.trim();
    if title.is_empty() {
        return Err(ItemError::MissingTitle);
    }

    let link = raw.link.trim();
    let has_host = Url::parse(link)
        .map(|u| u.host_str().is_some_and(|h| !h.is_empty()))
        .unwrap_or(false);
    if !has_host {
        return Err(ItemError::MalformedUrl(raw.link.clone()));
    }

    let normalized_url = normalize_url(link);
    let document_type = classify_document_type(link, raw.has_pdf);
    let is_pdf = document_type == DocumentType::Pdf;
    let current_year = now.year();
    let publication_year = extract_publication_year(
        raw.detected_date.as_deref(),
        title,
        &raw.snippet,
        current_year,
    );
    let academic = url_domain(&normalized_url)
        .map(|host| is_academic_domain(&host))
        .unwrap_or(false);
    let relevance = score_relevance(is_pdf, academic, publication_year, &raw.snippet, current_year);

    Ok(ProcessedResult {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        raw_result_id: Some(raw.id.clone()),
        title: title.to_string(),
        normalized_url,
        snippet: raw.snippet.trim().to_string(),
        publication_year,
        document_type,
        is_pdf,
        relevance_score: Some(relevance),
        duplicate_group_id: None,
        is_reviewed: false,
        review_priority: review_priority(relevance),
        position: raw.position,
        processed_at: now,
    })
}
