//! Entity recognition seam
//!
//! Recognition itself is a pluggable capability. The crate ships a
//! regex recognizer for the kinds that have a fixed surface form (email,
//! phone, ISO dates); name/place/organization detection needs an NLP
//! model and plugs in through the same trait.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Entity categories a recognizer may report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Person,
    Location,
    Phone,
    Email,
    Organization,
    Date,
}

impl EntityKind {
    /// Kind segment used inside tokens
    pub fn token_kind(&self) -> &'static str {
        match self {
            Self::Person => "PERSON",
            Self::Location => "LOCATION",
            Self::Phone => "PHONE_NUMBER",
            Self::Email => "EMAIL_ADDRESS",
            Self::Organization => "ORGANIZATION",
            Self::Date => "DATE_TIME",
        }
    }
}

/// A detected entity as byte offsets into the analyzed text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySpan {
    pub start: usize,
    pub end: usize,
    pub kind: EntityKind,
}

/// Pluggable entity detection
pub trait EntityRecognizer: Send + Sync {
    /// Return every entity span found in `text`
    fn analyze(&self, text: &str) -> Vec<EntitySpan>;

    /// Human-readable name (used in logs)
    fn name(&self) -> &str;
}

/// Pattern-based recognizer for emails, phone numbers and ISO dates
pub struct RegexRecognizer {
    rules: Vec<(EntityKind, Regex)>,
}

impl RegexRecognizer {
    /// Create a recognizer with the built-in rules
    pub fn new() -> Self {
        let rules = [
            (EntityKind::Email, r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}"),
            (
                EntityKind::Phone,
                r"\+?\d{1,3}[-. ]?\(?\d{3}\)?[-. ]?\d{3}[-. ]?\d{4}\b",
            ),
            (EntityKind::Date, r"\b\d{4}-\d{2}-\d{2}\b"),
        ];
        Self {
            rules: rules
                .into_iter()
                .filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|re| (kind, re)))
                .collect(),
        }
    }

    /// Create a recognizer from custom rules, rejecting invalid patterns
    pub fn with_rules(rules: &[(EntityKind, &str)]) -> crate::Result<Self> {
        let compiled = rules
            .iter()
            .map(|(kind, pattern)| {
                Regex::new(pattern)
                    .map(|re| (*kind, re))
                    .map_err(|e| crate::InsightError::Config(format!("{:?}: {}", kind, e)))
            })
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(Self { rules: compiled })
    }
}

impl Default for RegexRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityRecognizer for RegexRecognizer {
    fn analyze(&self, text: &str) -> Vec<EntitySpan> {
        let mut spans: Vec<EntitySpan> = Vec::new();
        for (kind, regex) in &self.rules {
            for m in regex.find_iter(text) {
                let overlaps = spans.iter().any(|s| m.start() < s.end && s.start < m.end());
                if !overlaps {
                    spans.push(EntitySpan {
                        start: m.start(),
                        end: m.end(),
                        kind: *kind,
                    });
                }
            }
        }
        spans.sort_by_key(|s| s.start);
        spans
    }

    fn name(&self) -> &str {
        "regex"
    }
}
