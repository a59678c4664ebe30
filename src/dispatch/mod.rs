//! Ordered fallback across model backends
//!
//! The dispatcher walks an injected list of backends in declared order.
//! Failures are classified per backend:
//!
//! - `RateLimited`: fixed backoff, retried up to `rate_limit_attempts`
//!   total attempts, then the next backend
//! - `NotFound`: next backend immediately
//! - `Other`: returned to the caller; never masked by fallback
//!
//! When every backend is exhausted, `dispatch` answers with
//! [`DEGRADED_MESSAGE`] instead of failing.

pub mod http;

pub use http::{ChatCompletionsBackend, SecretString};

use crate::error::{InsightError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Reply used when no backend could serve the request
pub const DEGRADED_MESSAGE: &str =
    "⚠️ High traffic: all analysis models are busy right now. Please try again in a minute.";

/// Failure surface of a single backend call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Quota or rate limit; worth retrying after a pause
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Model or endpoint does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Classify an unsuccessful HTTP response
    pub fn classify(status: u16, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body);
        let upper = body.to_ascii_uppercase();
        if status == 429 || upper.contains("RESOURCE_EXHAUSTED") || upper.contains("QUOTA") {
            Self::RateLimited(message)
        } else if status == 404 {
            Self::NotFound(message)
        } else {
            Self::Other(message)
        }
    }
}

/// A text completion endpoint
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Complete a prompt; `structured` requests a JSON-only response
    async fn complete(&self, prompt: &str, structured: bool) -> std::result::Result<String, BackendError>;
}

/// Relative price class of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostTier {
    #[default]
    Low,
    Standard,
    Premium,
}

/// Declarative description of one backend in the preference list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDescriptor {
    pub id: String,
    #[serde(default)]
    pub supports_structured_output: bool,
    #[serde(default)]
    pub cost_tier: CostTier,
}

impl BackendDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            supports_structured_output: false,
            cost_tier: CostTier::default(),
        }
    }

    pub fn structured(mut self, supported: bool) -> Self {
        self.supports_structured_output = supported;
        self
    }

    pub fn cost_tier(mut self, tier: CostTier) -> Self {
        self.cost_tier = tier;
        self
    }
}

/// Retry policy for rate-limited backends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    /// Total attempts per backend while it reports rate limiting
    #[serde(default = "default_rate_limit_attempts")]
    pub rate_limit_attempts: u32,
    /// Fixed pause between rate-limited attempts
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,
}

fn default_rate_limit_attempts() -> u32 {
    2
}

fn default_rate_limit_backoff_ms() -> u64 {
    1500
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            rate_limit_attempts: default_rate_limit_attempts(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
        }
    }
}

/// A successful completion and the backend that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub backend_id: String,
}

struct BackendEntry {
    descriptor: BackendDescriptor,
    backend: Arc<dyn ModelBackend>,
}

/// Deterministic ordered fallback over model backends
pub struct CallDispatcher {
    backends: Vec<BackendEntry>,
    config: DispatchConfig,
}

impl CallDispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            backends: Vec::new(),
            config,
        }
    }

    /// Append a backend; earlier backends are always preferred
    pub fn with_backend(mut self, descriptor: BackendDescriptor, backend: Arc<dyn ModelBackend>) -> Self {
        self.backends.push(BackendEntry { descriptor, backend });
        self
    }

    /// Backend descriptors in preference order
    pub fn descriptors(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.backends.iter().map(|e| &e.descriptor)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Run the fallback walk, surfacing exhaustion as an error
    pub async fn try_dispatch(&self, prompt: &str, structured: bool) -> Result<Completion> {
        if self.backends.is_empty() {
            return Err(InsightError::NoBackends);
        }

        let attempts = self.config.rate_limit_attempts.max(1);
        let backoff = Duration::from_millis(self.config.rate_limit_backoff_ms);
        let mut last_error = String::new();

        for entry in &self.backends {
            let id = entry.descriptor.id.as_str();
            let structured_mode = structured && entry.descriptor.supports_structured_output;

            for attempt in 1..=attempts {
                match entry.backend.complete(prompt, structured_mode).await {
                    Ok(text) => {
                        tracing::debug!(backend = %id, attempt, structured = structured_mode, "Backend answered");
                        return Ok(Completion {
                            text,
                            backend_id: id.to_string(),
                        });
                    }
                    Err(BackendError::RateLimited(message)) => {
                        tracing::warn!(backend = %id, attempt, max_attempts = attempts, "Backend rate limited");
                        last_error = message;
                        if attempt < attempts {
                            tokio::time::sleep(backoff).await;
                        }
                    }
                    Err(BackendError::NotFound(message)) => {
                        tracing::warn!(backend = %id, "Backend not found, skipping");
                        last_error = message;
                        break;
                    }
                    Err(BackendError::Other(message)) => {
                        tracing::error!(backend = %id, error = %message, "Backend failed");
                        return Err(InsightError::Backend {
                            backend: id.to_string(),
                            message,
                        });
                    }
                }
            }
        }

        Err(InsightError::BackendsExhausted {
            attempted: self.backends.len(),
            last_error,
        })
    }

    /// Run the fallback walk; exhaustion yields [`DEGRADED_MESSAGE`]
    pub async fn dispatch(&self, prompt: &str, structured: bool) -> Result<String> {
        match self.try_dispatch(prompt, structured).await {
            Ok(completion) => Ok(completion.text),
            Err(InsightError::BackendsExhausted { attempted, last_error }) => {
                tracing::warn!(attempted, last_error = %last_error, "All backends exhausted");
                Ok(DEGRADED_MESSAGE.to_string())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Backend that replays a fixed script of outcomes
    #[derive(Default)]
    pub struct ScriptedBackend {
        script: Mutex<VecDeque<std::result::Result<String, BackendError>>>,
        calls: Mutex<Vec<(String, bool)>>,
    }

    impl ScriptedBackend {
        pub fn new(script: Vec<std::result::Result<String, BackendError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn answering(texts: &[&str]) -> Self {
            Self::new(texts.iter().map(|t| Ok(t.to_string())).collect())
        }

        pub fn calls(&self) -> Vec<(String, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        async fn complete(&self, prompt: &str, structured: bool) -> std::result::Result<String, BackendError> {
            self.calls.lock().unwrap().push((prompt.to_string(), structured));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::Other("script exhausted".into())))
        }
    }

    pub fn fast_config() -> DispatchConfig {
        DispatchConfig {
            rate_limit_attempts: 2,
            rate_limit_backoff_ms: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{fast_config, ScriptedBackend};
    use super::*;

    fn quota() -> std::result::Result<String, BackendError> {
        Err(BackendError::RateLimited("RESOURCE_EXHAUSTED".into()))
    }

    #[tokio::test]
    async fn test_third_backend_answers_after_two_quota_failures() {
        let a = Arc::new(ScriptedBackend::new(vec![quota(), quota()]));
        let b = Arc::new(ScriptedBackend::new(vec![quota(), quota()]));
        let c = Arc::new(ScriptedBackend::answering(&["from c"]));

        let dispatcher = CallDispatcher::new(fast_config())
            .with_backend(BackendDescriptor::new("a"), a.clone())
            .with_backend(BackendDescriptor::new("b"), b.clone())
            .with_backend(BackendDescriptor::new("c"), c.clone());

        assert_eq!(dispatcher.dispatch("q", false).await.unwrap(), "from c");
        assert_eq!(a.calls().len(), 2);
        assert_eq!(b.calls().len(), 2);
        assert_eq!(c.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_retry_recovers_same_backend() {
        let a = Arc::new(ScriptedBackend::new(vec![quota(), Ok("second try".into())]));
        let b = Arc::new(ScriptedBackend::answering(&["unused"]));
        let dispatcher = CallDispatcher::new(fast_config())
            .with_backend(BackendDescriptor::new("a"), a.clone())
            .with_backend(BackendDescriptor::new("b"), b.clone());

        let completion = dispatcher.try_dispatch("q", false).await.unwrap();
        assert_eq!(completion.text, "second try");
        assert_eq!(completion.backend_id, "a");
        assert!(b.calls().is_empty());
    }

    #[tokio::test]
    async fn test_not_found_skips_without_retry() {
        let a = Arc::new(ScriptedBackend::new(vec![Err(BackendError::NotFound("404".into()))]));
        let b = Arc::new(ScriptedBackend::answering(&["b"]));
        let dispatcher = CallDispatcher::new(fast_config())
            .with_backend(BackendDescriptor::new("a"), a.clone())
            .with_backend(BackendDescriptor::new("b"), b);

        assert_eq!(dispatcher.dispatch("q", false).await.unwrap(), "b");
        assert_eq!(a.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_other_errors_propagate() {
        let a = Arc::new(ScriptedBackend::new(vec![Err(BackendError::Other("bad request".into()))]));
        let b = Arc::new(ScriptedBackend::answering(&["b"]));
        let dispatcher = CallDispatcher::new(fast_config())
            .with_backend(BackendDescriptor::new("a"), a)
            .with_backend(BackendDescriptor::new("b"), b.clone());

        let err = dispatcher.dispatch("q", false).await.unwrap_err();
        assert!(matches!(err, InsightError::Backend { ref backend, .. } if backend == "a"));
        assert!(b.calls().is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_is_degraded_not_error() {
        let a = Arc::new(ScriptedBackend::new(vec![quota(), quota()]));
        let dispatcher = CallDispatcher::new(fast_config()).with_backend(BackendDescriptor::new("a"), a);

        assert_eq!(dispatcher.dispatch("q", false).await.unwrap(), DEGRADED_MESSAGE);

        let a = Arc::new(ScriptedBackend::new(vec![quota(), quota()]));
        let dispatcher = CallDispatcher::new(fast_config()).with_backend(BackendDescriptor::new("a"), a);
        assert!(matches!(
            dispatcher.try_dispatch("q", false).await,
            Err(InsightError::BackendsExhausted { attempted: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_structured_mode_only_when_supported() {
        let a = Arc::new(ScriptedBackend::new(vec![Err(BackendError::NotFound("x".into()))]));
        let b = Arc::new(ScriptedBackend::answering(&["{}"]));
        let dispatcher = CallDispatcher::new(fast_config())
            .with_backend(BackendDescriptor::new("a").structured(true), a.clone())
            .with_backend(BackendDescriptor::new("b"), b.clone());

        dispatcher.dispatch("q", true).await.unwrap();
        assert!(a.calls()[0].1);
        assert!(!b.calls()[0].1);
    }

    #[tokio::test]
    async fn test_empty_dispatcher() {
        let dispatcher = CallDispatcher::new(DispatchConfig::default());
        assert!(matches!(
            dispatcher.dispatch("q", false).await,
            Err(InsightError::NoBackends)
        ));
    }

    #[test]
    fn test_classify() {
        assert!(matches!(BackendError::classify(429, ""), BackendError::RateLimited(_)));
        assert!(matches!(
            BackendError::classify(400, "{\"status\":\"RESOURCE_EXHAUSTED\"}"),
            BackendError::RateLimited(_)
        ));
        assert!(matches!(BackendError::classify(403, "quota exceeded"), BackendError::RateLimited(_)));
        assert!(matches!(BackendError::classify(404, "no model"), BackendError::NotFound(_)));
        assert!(matches!(BackendError::classify(500, "boom"), BackendError::Other(_)));
    }

    #[test]
    fn test_config_defaults() {
        let config: DispatchConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.rate_limit_attempts, 2);
        assert_eq!(config.rate_limit_backoff_ms, 1500);
    }
}
