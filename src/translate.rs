//! Query and answer translation
//!
//! Translation only ever sees masked text: the query is protected before
//! `detect_and_translate` and answers are restored after
//! `translate_back`. A translation that drops or alters a token is
//! discarded in favor of the input.

use crate::dispatch::CallDispatcher;
use crate::vault::token_pattern;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// How answers are translated back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationMode {
    /// Translate prose, keep data, lists and tables as-is
    #[default]
    Mixed,
    /// Translate everything
    Mirror,
}

impl std::str::FromStr for TranslationMode {
    type Err = crate::InsightError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mixed" => Ok(Self::Mixed),
            "mirror" => Ok(Self::Mirror),
            other => Err(crate::InsightError::Config(format!(
                "unknown translation mode '{}'",
                other
            ))),
        }
    }
}

/// Detected language and the English form of a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    #[serde(rename = "detected_language")]
    pub language: String,
    #[serde(rename = "english_query")]
    pub english: String,
}

impl Translation {
    pub fn english(text: &str) -> Self {
        Self {
            language: "English".to_string(),
            english: text.to_string(),
        }
    }

    pub fn is_english(&self) -> bool {
        is_english(&self.language)
    }
}

fn is_english(language: &str) -> bool {
    matches!(
        language.trim().to_ascii_lowercase().as_str(),
        "" | "english" | "en" | "unknown"
    )
}

/// Language detection and translation; never fails
#[async_trait]
pub trait Translator: Send + Sync {
    async fn detect_and_translate(&self, masked_text: &str) -> Translation;

    async fn translate_back(&self, text: &str, language: &str, mode: TranslationMode) -> String;
}

/// Treats every query as English
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTranslator;

#[async_trait]
impl Translator for PassthroughTranslator {
    async fn detect_and_translate(&self, masked_text: &str) -> Translation {
        Translation::english(masked_text)
    }

    async fn translate_back(&self, text: &str, _language: &str, _mode: TranslationMode) -> String {
        text.to_string()
    }
}

/// Translator backed by the model dispatcher
pub struct DispatchTranslator {
    dispatcher: Arc<CallDispatcher>,
}

impl DispatchTranslator {
    pub fn new(dispatcher: Arc<CallDispatcher>) -> Self {
        Self { dispatcher }
    }
}

fn tokens(text: &str) -> BTreeSet<&str> {
    token_pattern().find_iter(text).map(|m| m.as_str()).collect()
}

/// True when every token of `source` survives in `translated`
fn keeps_tokens(source: &str, translated: &str) -> bool {
    tokens(source).is_subset(&tokens(translated))
}

fn strip_json_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

fn detect_prompt(text: &str) -> String {
    format!(
        r#"Role: Expert technical translator.

USER INPUT: "{text}"

TASK:
1. Identify the language.
2. Translate to precise technical English.
3. Do not generalize nouns.
4. Copy placeholders such as <PERSON_1> or <COUN_2> exactly.

JSON OUTPUT:
{{"detected_language": "Language Name", "english_query": "Translated Text"}}"#
    )
}

fn back_prompt(text: &str, language: &str, mode: TranslationMode) -> String {
    let instructions = match mode {
        TranslationMode::Mixed => format!(
            "Task: Translate the explanations and sentences into {language}.\n\
             Keep data, lists and markdown tables in English; do not translate the items inside.\n\
             Leave long lists exactly as they are."
        ),
        TranslationMode::Mirror => format!("Task: Fully translate everything into {language}."),
    };
    format!(
        "{instructions}\n\nKeep markdown formatting and placeholders such as <PERSON_1> exactly as is.\n\nTEXT TO PROCESS:\n{text}"
    )
}

#[async_trait]
impl Translator for DispatchTranslator {
    async fn detect_and_translate(&self, masked_text: &str) -> Translation {
        let response = match self.dispatcher.try_dispatch(&detect_prompt(masked_text), true).await {
            Ok(completion) => completion.text,
            Err(e) => {
                tracing::warn!(error = %e, "Language detection failed, assuming English");
                return Translation::english(masked_text);
            }
        };

        match serde_json::from_str::<Translation>(strip_json_fence(&response)) {
            Ok(t) if t.english.trim().is_empty() => Translation::english(masked_text),
            Ok(t) if !keeps_tokens(masked_text, &t.english) => {
                tracing::warn!(language = %t.language, "Translation dropped placeholders, using input");
                Translation {
                    language: t.language,
                    english: masked_text.to_string(),
                }
            }
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable language detection, assuming English");
                Translation::english(masked_text)
            }
        }
    }

    async fn translate_back(&self, text: &str, language: &str, mode: TranslationMode) -> String {
        if is_english(language) {
            return text.to_string();
        }
        match self.dispatcher.try_dispatch(&back_prompt(text, language, mode), false).await {
            Ok(completion) if keeps_tokens(text, &completion.text) => completion.text,
            Ok(_) => {
                tracing::warn!(language = %language, "Back-translation dropped placeholders");
                text.to_string()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Back-translation failed");
                text.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::{fast_config, ScriptedBackend};
    use crate::dispatch::{BackendDescriptor, BackendError};

    fn translator(backend: Arc<ScriptedBackend>) -> DispatchTranslator {
        DispatchTranslator::new(Arc::new(
            CallDispatcher::new(fast_config())
                .with_backend(BackendDescriptor::new("m").structured(true), backend),
        ))
    }

    #[tokio::test]
    async fn test_detect_parses_fenced_json() {
        let backend = Arc::new(ScriptedBackend::answering(&[
            "```json\n{\"detected_language\": \"French\", \"english_query\": \"show <COUN_1> sales\"}\n```",
        ]));
        let t = translator(backend.clone())
            .detect_and_translate("montre les ventes <COUN_1>")
            .await;
        assert_eq!(t.language, "French");
        assert_eq!(t.english, "show <COUN_1> sales");
        assert!(backend.calls()[0].1, "structured mode requested");
    }

    #[tokio::test]
    async fn test_detect_falls_back_on_garbage() {
        let backend = Arc::new(ScriptedBackend::answering(&["not json"]));
        let t = translator(backend).detect_and_translate("hola").await;
        assert_eq!(t, Translation::english("hola"));
    }

    #[tokio::test]
    async fn test_detect_rejects_lost_tokens() {
        let backend = Arc::new(ScriptedBackend::answering(&[
            "{\"detected_language\": \"Spanish\", \"english_query\": \"show France\"}",
        ]));
        let t = translator(backend).detect_and_translate("muestra <COUN_1>").await;
        assert_eq!(t.language, "Spanish");
        assert_eq!(t.english, "muestra <COUN_1>");
    }

    #[tokio::test]
    async fn test_back_skips_english_and_falls_back() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(BackendError::Other("x".into()))]));
        let tr = translator(backend.clone());
        assert_eq!(tr.translate_back("hi", "English", TranslationMode::Mixed).await, "hi");
        assert!(backend.calls().is_empty());
        assert_eq!(tr.translate_back("hi", "German", TranslationMode::Mirror).await, "hi");
    }

    #[tokio::test]
    async fn test_back_mode_prompts() {
        let backend = Arc::new(ScriptedBackend::answering(&["Hay 2 <COUN_1>", "x"]));
        let tr = translator(backend.clone());
        let out = tr.translate_back("There are 2 <COUN_1>", "Spanish", TranslationMode::Mixed).await;
        assert_eq!(out, "Hay 2 <COUN_1>");
        assert!(backend.calls()[0].0.contains("Keep data, lists and markdown tables in English"));

        // Dropped token: keep the input
        let out = tr.translate_back("There are 2 <COUN_1>", "Spanish", TranslationMode::Mirror).await;
        assert_eq!(out, "There are 2 <COUN_1>");
        assert!(backend.calls()[1].0.contains("Fully translate everything into Spanish"));
    }

    #[tokio::test]
    async fn test_passthrough() {
        let t = PassthroughTranslator.detect_and_translate("x").await;
        assert!(t.is_english());
        assert_eq!(PassthroughTranslator.translate_back("y", "French", TranslationMode::Mirror).await, "y");
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("MIXED".parse::<TranslationMode>().unwrap(), TranslationMode::Mixed);
        assert_eq!("mirror".parse::<TranslationMode>().unwrap(), TranslationMode::Mirror);
        assert!("other".parse::<TranslationMode>().is_err());
    }
}
