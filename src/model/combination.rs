use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::common::order_independent_hash;

/// A response the delivery platform says should exist
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedCombination {
    pub unit_key: String,
    pub login_name: String,
    pub login_code: String,
    pub booklet_id: String,
    pub variable_id: String,
}

impl ExpectedCombination {
    /// Canonical single-line encoding used for hashing. Fields are length-prefixed
    /// so that values containing the separator cannot collide.
    pub fn canonical(&self) -> String {
        [
            &self.unit_key,
            &self.login_name,
            &self.login_code,
            &self.booklet_id,
            &self.variable_id,
        ]
        .iter()
        .map(|field| format!("{}:{}", field.len(), field))
        .collect::<Vec<_>>()
        .join("|")
    }
}

/// Stable digest of a list of combinations, independent of list order
pub fn combinations_hash(combinations: &[ExpectedCombination]) -> String {
    order_independent_hash(combinations.iter().map(ExpectedCombination::canonical))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CombinationStatus {
    Exists,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub combination: ExpectedCombination,
    pub status: CombinationStatus,
}

/// Full outcome of one completeness run, as stored in the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResultSet {
    pub results: Vec<ValidationResult>,
    pub total: usize,
    pub missing: usize,
    pub timestamp: DateTime<Utc>,
}

impl ValidationResultSet {
    pub fn from_results(results: Vec<ValidationResult>) -> Self {
        let missing = results
            .iter()
            .filter(|r| r.status == CombinationStatus::Missing)
            .count();
        Self {
            total: results.len(),
            missing,
            results,
            timestamp: Utc::now(),
        }
    }

    pub fn exists(&self) -> usize {
        self.total - self.missing
    }
}

/// Pagination metadata for a page slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

impl PageInfo {
    /// `page` is 1-based; values below 1 are treated as 1
    pub fn new(total: usize, page: usize, page_size: usize) -> Self {
        let page = page.max(1);
        let total_pages = if page_size == 0 {
            0
        } else {
            total.div_ceil(page_size)
        };
        Self {
            page,
            page_size,
            total_pages,
            has_next_page: page < total_pages,
            has_previous_page: page > 1,
        }
    }

    /// Index range `[(page-1)*size, page*size)` clamped to `total`
    pub fn range(&self, total: usize) -> std::ops::Range<usize> {
        let start = (self.page - 1).saturating_mul(self.page_size).min(total);
        let end = start.saturating_add(self.page_size).min(total);
        start..end
    }
}
