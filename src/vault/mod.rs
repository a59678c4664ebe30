//! Reversible entity tokenization
//!
//! Sensitive values are swapped for opaque `<KIND_n>` tokens before any
//! text leaves the process and swapped back once the model has answered.
//!
//! - `EntityMap`: the per-session forward/reverse bijection
//! - `ColumnPolicy`: named heuristics deciding which columns to tokenize
//! - `EntityRecognizer`: pluggable span detection for free text
//! - `TokenizationEngine`: bulk ingest, free-text protect, restore

pub mod engine;
pub mod policy;
pub mod recognizer;

pub use engine::{Ingested, Protected, TokenizationEngine};
pub use policy::ColumnPolicy;
pub use recognizer::{EntityKind, EntityRecognizer, EntitySpan, RegexRecognizer};

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Shape of every token this crate emits: `<KIND>` segments of uppercase
/// alphanumerics joined by `_`, ending in a numeric suffix.
pub(crate) fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<[A-Z0-9]+(?:_[A-Z0-9]+)*_[0-9]+>").unwrap())
}

/// Format a token from a kind and index
pub fn format_token(kind: &str, index: usize) -> String {
    format!("<{}_{}>", kind, index)
}

/// Per-session bijection between original values and tokens
///
/// `forward` is keyed by the lower-cased original so lookups are
/// case-insensitive; `reverse` keeps the first-seen casing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityMap {
    #[serde(default)]
    forward: HashMap<String, String>,
    #[serde(default)]
    reverse: HashMap<String, String>,

    /// Next free index per kind, rebuilt lazily after deserialization
    #[serde(skip)]
    next_index: HashMap<String, usize>,
}

impl PartialEq for EntityMap {
    fn eq(&self, other: &Self) -> bool {
        self.forward == other.forward && self.reverse == other.reverse
    }
}

impl EntityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
    }

    /// Token already assigned to a value (case-insensitive)
    pub fn token_for(&self, value: &str) -> Option<&str> {
        self.forward.get(&value.to_lowercase()).map(String::as_str)
    }

    /// Original value behind a token
    pub fn original(&self, token: &str) -> Option<&str> {
        self.reverse.get(token).map(String::as_str)
    }

    /// Forward entries as (lower-cased original, token)
    pub fn forward_entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.forward.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Return the value's token, allocating `<KIND_n>` with the next free
    /// index when the value is new. Returns `(token, newly_allocated)`.
    pub fn assign(&mut self, kind: &str, value: &str) -> (String, bool) {
        let key = value.to_lowercase();
        if let Some(existing) = self.forward.get(&key) {
            return (existing.clone(), false);
        }

        let start = match self.next_index.get(kind) {
            Some(next) => *next,
            None => self.scan_next_index(kind),
        };
        let mut index = start;
        let mut token = format_token(kind, index);
        while self.reverse.contains_key(&token) {
            index += 1;
            token = format_token(kind, index);
        }
        self.next_index.insert(kind.to_string(), index + 1);

        self.forward.insert(key, token.clone());
        self.reverse.insert(token.clone(), value.to_string());
        (token, true)
    }

    /// Merge another map; entries whose value or token is already taken are skipped
    pub fn merge(&mut self, other: &EntityMap) -> usize {
        let mut added = 0;
        for (token, original) in &other.reverse {
            let key = original.to_lowercase();
            if self.forward.contains_key(&key) || self.reverse.contains_key(token) {
                continue;
            }
            self.forward.insert(key, token.clone());
            self.reverse.insert(token.clone(), original.clone());
            added += 1;
        }
        if added > 0 {
            self.next_index.clear();
        }
        added
    }

    fn scan_next_index(&self, kind: &str) -> usize {
        let prefix = format!("<{}_", kind);
        self.reverse
            .keys()
            .filter_map(|t| t.strip_prefix(&prefix)?.strip_suffix('>')?.parse::<usize>().ok())
            .max()
            .map(|max| max + 1)
            .unwrap_or(1)
    }
}
