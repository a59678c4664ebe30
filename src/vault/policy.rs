//! Column classification policy for bulk ingestion
//!
//! Prose columns (descriptions, notes, reviews) are left alone: tokenizing
//! whole sentences destroys the data without protecting discrete entities.

use serde::{Deserialize, Serialize};

/// Keywords that mark a column as free text when they appear in its name
pub const FREE_TEXT_KEYWORDS: &[&str] = &[
    "description",
    "note",
    "comment",
    "summary",
    "text",
    "content",
    "review",
];

/// Columns whose mean value length exceeds this many chars hold prose
pub const MAX_MEAN_VALUE_LEN: f64 = 40.0;

/// Values shorter than this (after trimming) are never tokenized
pub const MIN_VALUE_LEN: usize = 2;

/// Kind prefix length derived from a column name
pub const PREFIX_LEN: usize = 4;

/// Tunable column heuristics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnPolicy {
    #[serde(default = "default_keywords")]
    pub free_text_keywords: Vec<String>,
    #[serde(default = "default_max_mean_len")]
    pub max_mean_value_len: f64,
    #[serde(default = "default_min_value_len")]
    pub min_value_len: usize,
}

fn default_keywords() -> Vec<String> {
    FREE_TEXT_KEYWORDS.iter().map(|k| k.to_string()).collect()
}

fn default_max_mean_len() -> f64 {
    MAX_MEAN_VALUE_LEN
}

fn default_min_value_len() -> usize {
    MIN_VALUE_LEN
}

impl Default for ColumnPolicy {
    fn default() -> Self {
        Self {
            free_text_keywords: default_keywords(),
            max_mean_value_len: MAX_MEAN_VALUE_LEN,
            min_value_len: MIN_VALUE_LEN,
        }
    }
}

impl ColumnPolicy {
    /// True when the column holds prose rather than discrete entities
    pub fn is_free_text_column(&self, name: &str, avg_len: f64) -> bool {
        let lower = name.to_lowercase();
        self.free_text_keywords
            .iter()
            .any(|k| lower.contains(k.as_str()))
            || avg_len > self.max_mean_value_len
    }

    /// True when a single cell value is long enough to tokenize
    pub fn is_maskable_value(&self, value: &str) -> bool {
        value.trim().chars().count() >= self.min_value_len
    }

    /// Four-character uppercase kind prefix derived from a column name
    pub fn column_prefix(name: &str) -> String {
        let prefix: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .take(PREFIX_LEN)
            .collect();
        if prefix.is_empty() {
            "COL".to_string()
        } else {
            prefix
        }
    }
}

/// Mean char length of a set of values (0.0 when empty)
pub fn mean_len<'a>(values: impl Iterator<Item = &'a str>) -> f64 {
    let (total, count) = values.fold((0usize, 0usize), |(t, c), v| (t + v.chars().count(), c + 1));
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}
