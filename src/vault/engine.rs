//! Tokenization engine: bulk ingest, free-text protect, restore
//!
//! The engine is pure over an `EntityMap`; loading and persisting the map
//! for a session is the caller's job (see `SessionCache`).

use super::policy::{mean_len, ColumnPolicy};
use super::recognizer::EntityRecognizer;
use super::{token_pattern, EntityMap};
use crate::dataset::{CellValue, Table};
use regex::RegexBuilder;
use std::sync::Arc;

/// Score when at least one value was masked
pub const SCORE_PROTECTED: u8 = 100;
/// Score when a map exists but nothing in the text matched it
pub const SCORE_NO_MATCH: u8 = 80;
/// Score when the session has no map: masking unavailable
pub const SCORE_UNAVAILABLE: u8 = 50;

/// Outcome of bulk ingestion
#[derive(Debug, Clone)]
pub struct Ingested {
    /// The table with every tokenized cell replaced by its token
    pub masked: Table,
    /// Columns whose values were tokenized
    pub tokenized_columns: Vec<String>,
    /// Text columns skipped by the free-text policy
    pub skipped_columns: Vec<String>,
    /// Number of values added to the map
    pub new_entries: usize,
}

/// Outcome of free-text protection
#[derive(Debug, Clone, PartialEq)]
pub struct Protected {
    pub text: String,
    pub score: u8,
    pub substitutions: usize,
    /// Entries added to the map by the recognizer during this call
    pub new_entries: usize,
}

/// Builds and applies the entity mapping
#[derive(Clone, Default)]
pub struct TokenizationEngine {
    policy: ColumnPolicy,
    recognizer: Option<Arc<dyn EntityRecognizer>>,
}

impl TokenizationEngine {
    pub fn new(policy: ColumnPolicy) -> Self {
        Self {
            policy,
            recognizer: None,
        }
    }

    /// Attach a recognizer consulted by `protect` to grow the map
    pub fn with_recognizer(mut self, recognizer: Arc<dyn EntityRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn policy(&self) -> &ColumnPolicy {
        &self.policy
    }

    /// Tokenize the discrete-value text columns of a table
    ///
    /// New values are merged into `map`; the returned table is the only
    /// form of the data that may be stored or sent out.
    pub fn ingest(&self, table: &Table, map: &mut EntityMap) -> Ingested {
        let mut masked = table.clone();
        let mut tokenized_columns = Vec::new();
        let mut skipped_columns = Vec::new();
        let mut new_entries = 0;

        for (idx, name) in table.columns().iter().enumerate() {
            let texts: Vec<&str> = table.column_values(idx).filter_map(CellValue::as_text).collect();
            if texts.is_empty() {
                continue;
            }

            let avg_len = mean_len(texts.iter().copied());
            if self.policy.is_free_text_column(name, avg_len) {
                tracing::debug!(column = %name, avg_len, "Skipping free-text column");
                skipped_columns.push(name.clone());
                continue;
            }

            let prefix = ColumnPolicy::column_prefix(name);
            let mut column_hits = 0;
            for row in masked.rows_mut() {
                let Some(CellValue::Text(value)) = row.get(idx) else {
                    continue;
                };
                let value = value.trim();
                if !self.policy.is_maskable_value(value) {
                    continue;
                }
                let (token, is_new) = map.assign(&prefix, value);
                if is_new {
                    new_entries += 1;
                }
                row[idx] = CellValue::Text(token);
                column_hits += 1;
            }

            if column_hits > 0 {
                tokenized_columns.push(name.clone());
            }
        }

        tracing::info!(
            tokenized = tokenized_columns.len(),
            skipped = skipped_columns.len(),
            new_entries,
            "Dataset ingested"
        );

        Ingested {
            masked,
            tokenized_columns,
            skipped_columns,
            new_entries,
        }
    }

    /// Mask known entities in free text
    ///
    /// Without a map the text passes through unchanged with a floor score.
    /// With one, recognizer spans are registered first, then every known
    /// value is replaced longest-first on whole-word, case-insensitive
    /// matches. Text already inside a token is never touched.
    pub fn protect(&self, text: &str, map: Option<&mut EntityMap>) -> Protected {
        let Some(map) = map else {
            return Protected {
                text: text.to_string(),
                score: SCORE_UNAVAILABLE,
                substitutions: 0,
                new_entries: 0,
            };
        };

        let mut new_entries = 0;
        if let Some(recognizer) = &self.recognizer {
            for span in recognizer.analyze(text) {
                let Some(value) = text.get(span.start..span.end) else {
                    continue;
                };
                if self.policy.is_maskable_value(value) && map.assign(span.kind.token_kind(), value).1 {
                    new_entries += 1;
                }
            }
        }

        // Keys are fully lower-cased but the regex folds case simply, so
        // patterns are built from the original spelling.
        let map: &EntityMap = map;
        let mut entries: Vec<(&str, &str, &str)> = map
            .forward_entries()
            .map(|(key, token)| (key, token, map.original(token).unwrap_or(key)))
            .collect();
        entries.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()).then(a.0.cmp(b.0)));

        let mut masked = text.to_string();
        let mut lower = masked.to_lowercase();
        let mut substitutions = 0;

        for (key, token, original) in entries {
            if key.is_empty() || !lower.contains(key) {
                continue;
            }
            let hits = replace_whole_words(&mut masked, original, token);
            if hits > 0 {
                substitutions += hits;
                lower = masked.to_lowercase();
            }
        }

        let score = if substitutions > 0 {
            SCORE_PROTECTED
        } else {
            SCORE_NO_MATCH
        };

        Protected {
            text: masked,
            score,
            substitutions,
            new_entries,
        }
    }

    /// Replace every mapped token with its original value
    ///
    /// Single pass; unmapped tokens and token-free text are returned as-is.
    pub fn restore(&self, text: &str, map: Option<&EntityMap>) -> String {
        restore_text(text, map)
    }

    /// Restore every string inside a JSON value
    pub fn restore_json(&self, value: &serde_json::Value, map: Option<&EntityMap>) -> serde_json::Value {
        use serde_json::Value;
        match value {
            Value::String(s) => Value::String(restore_text(s, map)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.restore_json(v, map)).collect()),
            Value::Object(obj) => Value::Object(
                obj.iter()
                    .map(|(k, v)| (restore_text(k, map), self.restore_json(v, map)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

fn restore_text(text: &str, map: Option<&EntityMap>) -> String {
    let Some(map) = map else {
        return text.to_string();
    };
    if map.is_empty() || !text.contains('<') {
        return text.to_string();
    }
    token_pattern()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let token = &caps[0];
            map.original(token).unwrap_or(token).to_string()
        })
        .into_owned()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Replace whole-word, case-insensitive occurrences of `key` outside
/// existing tokens. Returns the number of replacements.
fn replace_whole_words(text: &mut String, key: &str, token: &str) -> usize {
    let left = if key.chars().next().is_some_and(is_word_char) { r"\b" } else { "" };
    let right = if key.chars().last().is_some_and(is_word_char) { r"\b" } else { "" };
    let pattern = format!("{}{}{}", left, regex::escape(key), right);
    let Ok(re) = RegexBuilder::new(&pattern).case_insensitive(true).build() else {
        return 0;
    };

    let taken: Vec<(usize, usize)> = token_pattern()
        .find_iter(text)
        .map(|m| (m.start(), m.end()))
        .collect();

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut hits = 0;
    for m in re.find_iter(text) {
        if taken.iter().any(|(s, e)| m.start() < *e && *s < m.end()) {
            continue;
        }
        out.push_str(&text[last..m.start()]);
        out.push_str(token);
        last = m.end();
        hits += 1;
    }
    if hits > 0 {
        out.push_str(&text[last..]);
        *text = out;
    }
    hits
}
