//! Session statistics handed to the reporting side.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metadata::is_academic_domain;
use crate::models::{DuplicateGroup, ProcessedResult};
use crate::similarity::url_domain;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub total_results: u64,
    pub processed_results: u64,
    pub duplicate_groups: u64,
    /// Processed results minus the non-canonical members of every group.
    pub unique_results: u64,
    pub average_relevance: f64,
    pub document_type_distribution: BTreeMap<String, u64>,
    /// Keyed by year; results without a year fall under `"unknown"`.
    pub publication_year_distribution: BTreeMap<String, u64>,
    pub full_text_percentage: f64,
    pub academic_percentage: f64,
}

impl SessionStatistics {
    pub fn compute(
        total_raw: u64,
        results: &[ProcessedResult],
        groups: &[DuplicateGroup],
    ) -> Self {
        let processed = results.len() as u64;
        let duplicates: u64 = groups.iter().map(DuplicateGroup::duplicate_count).sum();

        let scores: Vec<f64> = results.iter().filter_map(|r| r.relevance_score).collect();
        let average_relevance = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };

        let mut document_type_distribution = BTreeMap::new();
        let mut publication_year_distribution = BTreeMap::new();
        let mut full_text = 0u64;
        let mut academic = 0u64;
        for result in results {
            *document_type_distribution
                .entry(result.document_type.to_string())
                .or_insert(0) += 1;
            let year = result
                .publication_year
                .map(|y| y.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            *publication_year_distribution.entry(year).or_insert(0) += 1;
            if result.is_pdf {
                full_text += 1;
            }
            if url_domain(&result.normalized_url).is_some_and(|host| is_academic_domain(&host)) {
                academic += 1;
            }
        }

        Self {
            total_results: total_raw,
            processed_results: processed,
            duplicate_groups: groups.len() as u64,
            unique_results: processed.saturating_sub(duplicates),
            average_relevance,
            document_type_distribution,
            publication_year_distribution,
            full_text_percentage: percentage(full_text, processed),
            academic_percentage: percentage(academic, processed),
        }
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
