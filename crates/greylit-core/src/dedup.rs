//! Duplicate detection over a session's processed results.
//!
//! Pairwise O(n²) comparison, acceptable because a search session holds a
//! bounded number of results. Each pair runs four detectors in priority
//! order and stops at the first one whose condition holds:
//!
//! | Detector | Condition | Confidence |
//! |----------|-----------|------------|
//! | `exact_url` | normalized URLs are equal | 1.0 |
//! | `title_match` | title similarity ≥ 0.9 | the similarity |
//! | `fuzzy_match` | same domain, keyword overlap ≥ 0.7 | the overlap |
//! | `content_hash` | both snippets present, snippet similarity ≥ 0.8 | the similarity |
//!
//! A match joins the group only when its confidence reaches the detector's
//! threshold (default 0.85). Records are grouped greedily in input order:
//! the first record of a group is its canonical member, and a record that
//! joined a group is never compared again.

use std::collections::HashSet;

use crate::models::{ProcessedResult, SimilarityType};
use crate::similarity::{
    content_fingerprint, extract_keywords, keyword_overlap, normalize_url, title_similarity,
    url_domain,
};

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;
pub const TITLE_MATCH_THRESHOLD: f64 = 0.9;
pub const KEYWORD_OVERLAP_THRESHOLD: f64 = 0.7;
pub const CONTENT_SIMILARITY_THRESHOLD: f64 = 0.8;

/// Tolerance for score comparisons, so a score that is mathematically equal
/// to a threshold is not rejected by floating-point rounding.
const SCORE_EPSILON: f64 = 1e-9;

/// A record the detector can compare.
pub trait Dedupable {
    fn id(&self) -> &str;
    fn title(&self) -> &str;
    fn url(&self) -> &str;
    fn snippet(&self) -> &str;
}

impl Dedupable for ProcessedResult {
    fn id(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn url(&self) -> &str {
        &self.normalized_url
    }

    fn snippet(&self) -> &str {
        &self.snippet
    }
}

/// Outcome of comparing one pair of records.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DuplicateMatch {
    pub similarity_type: SimilarityType,
    pub confidence: f64,
}

/// A detected cluster: the canonical record plus the records matched to it.
#[derive(Debug, Clone)]
pub struct DetectedGroup<'a, T> {
    pub canonical: &'a T,
    pub duplicates: Vec<&'a T>,
    /// Type of the highest-confidence match in the group.
    pub similarity_type: SimilarityType,
    pub confidence: f64,
}

impl<T> DetectedGroup<'_, T> {
    /// All members, the canonical one included.
    pub fn result_count(&self) -> usize {
        self.duplicates.len() + 1
    }

    pub fn members(&self) -> impl Iterator<Item = &T> {
        std::iter::once(self.canonical).chain(self.duplicates.iter().copied())
    }
}

/// Values derived once per record before the pairwise pass.
struct Features {
    normalized_url: String,
    domain: Option<String>,
    keywords: HashSet<String>,
    fingerprint: Option<String>,
}

impl Features {
    fn of<T: Dedupable>(record: &T) -> Self {
        let snippet = record.snippet().trim();
        Self {
            normalized_url: normalize_url(record.url()),
            domain: url_domain(record.url()),
            keywords: extract_keywords(record.title()),
            fingerprint: (!snippet.is_empty()).then(|| content_fingerprint(snippet)),
        }
    }
}

/// Pairwise duplicate detector with a configurable acceptance threshold.
#[derive(Debug, Clone, Copy)]
pub struct DuplicateDetector {
    threshold: f64,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl DuplicateDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Compare two records; `Some` only for a match that reaches the
    /// threshold.
    pub fn compare<T: Dedupable>(&self, a: &T, b: &T) -> Option<DuplicateMatch> {
        self.compare_features(a, &Features::of(a), b, &Features::of(b))
    }

    fn compare_features<T: Dedupable>(
        &self,
        a: &T,
        fa: &Features,
        b: &T,
        fb: &Features,
    ) -> Option<DuplicateMatch> {
        let candidate = first_detector_match(a, fa, b, fb)?;
        (candidate.confidence + SCORE_EPSILON >= self.threshold).then_some(candidate)
    }

    /// Group the records into duplicate clusters. Singletons are not
    /// returned; the input order decides which record is canonical.
    pub fn find_groups<'a, T: Dedupable>(&self, records: &'a [T]) -> Vec<DetectedGroup<'a, T>> {
        let features: Vec<Features> = records.iter().map(Features::of).collect();
        let mut grouped = vec![false; records.len()];
        let mut groups = Vec::new();

        for i in 0..records.len() {
            if grouped[i] {
                continue;
            }

            let mut duplicates = Vec::new();
            let mut best: Option<DuplicateMatch> = None;

            for j in (i + 1)..records.len() {
                if grouped[j] {
                    continue;
                }
                let Some(found) =
                    self.compare_features(&records[i], &features[i], &records[j], &features[j])
                else {
                    continue;
                };

                grouped[j] = true;
                duplicates.push(&records[j]);
                if best.map_or(true, |b| found.confidence > b.confidence) {
                    best = Some(found);
                }
            }

            if let Some(best) = best {
                grouped[i] = true;
                groups.push(DetectedGroup {
                    canonical: &records[i],
                    duplicates,
                    similarity_type: best.similarity_type,
                    confidence: best.confidence,
                });
            }
        }

        groups
    }
}

/// Run the detectors in priority order and return the first whose
/// condition holds, regardless of the acceptance threshold.
fn first_detector_match<T: Dedupable>(
    a: &T,
    fa: &Features,
    b: &T,
    fb: &Features,
) -> Option<DuplicateMatch> {
    if fa.normalized_url == fb.normalized_url {
        return Some(DuplicateMatch {
            similarity_type: SimilarityType::ExactUrl,
            confidence: 1.0,
        });
    }

    let title = title_similarity(a.title(), b.title());
    if title + SCORE_EPSILON >= TITLE_MATCH_THRESHOLD {
        return Some(DuplicateMatch {
            similarity_type: SimilarityType::TitleMatch,
            confidence: title,
        });
    }

    if fa.domain.is_some() && fa.domain == fb.domain {
        let overlap = keyword_overlap(&fa.keywords, &fb.keywords);
        if overlap + SCORE_EPSILON >= KEYWORD_OVERLAP_THRESHOLD {
            return Some(DuplicateMatch {
                similarity_type: SimilarityType::FuzzyMatch,
                confidence: overlap,
            });
        }
    }

    if let (Some(fpa), Some(fpb)) = (&fa.fingerprint, &fb.fingerprint) {
        let content = if fpa == fpb {
            1.0
        } else {
            title_similarity(a.snippet().trim(), b.snippet().trim())
        };
        if content + SCORE_EPSILON >= CONTENT_SIMILARITY_THRESHOLD {
            return Some(DuplicateMatch {
                similarity_type: SimilarityType::ContentHash,
                confidence: content,
            });
        }
    }

    None
}

/// How much metadata a processed result carries; used to choose the
/// canonical member when a group is merged.
pub fn metadata_completeness(result: &ProcessedResult) -> u32 {
    let mut score = 0;
    if !result.title.trim().is_empty() {
        score += 1;
    }
    if !result.snippet.trim().is_empty() {
        score += 1;
    }
    if result.snippet.chars().count() >= 100 {
        score += 1;
    }
    if result.publication_year.is_some() {
        score += 1;
    }
    if result.is_pdf {
        score += 1;
    }
    if result.relevance_score.is_some() {
        score += 1;
    }
    score
}

/// Index of the most metadata-complete member; ties keep the earliest.
/// Returns `None` for an empty slice.
pub fn select_canonical(members: &[ProcessedResult]) -> Option<usize> {
    members
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, u32)>, (i, member)| {
            let score = metadata_completeness(member);
            match best {
                Some((_, best_score)) if best_score >= score => best,
                _ => Some((i, score)),
            }
        })
        .map(|(i, _)| i)
}
