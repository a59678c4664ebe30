//! Configuration
//!
//! A single camelCase JSON document. Every section has defaults, so an
//! empty file (`{}`) is valid. API keys and the sealing key are never
//! stored in the file, only the names of the environment variables that
//! hold them.

use crate::analyst::{ExecutionConfig, PipelineConfig};
use crate::crypto::Aes256GcmSealer;
use crate::dispatch::{BackendDescriptor, CallDispatcher, ChatCompletionsBackend, CostTier, DispatchConfig};
use crate::error::{InsightError, Result};
use crate::store::{FileSessionStore, MemorySessionStore, SessionStore};
use crate::translate::{DispatchTranslator, PassthroughTranslator, TranslationMode, Translator};
use crate::vault::policy::ColumnPolicy;
use crate::vault::recognizer::RegexRecognizer;
use crate::vault::TokenizationEngine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Key id recorded in sealed records written with the configured key
pub const SEALING_KEY_ID: &str = "primary";

/// One entry of the ordered backend preference list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Identifier used in logs; defaults to the model name
    #[serde(default)]
    pub id: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key
    pub api_key_env: String,
    #[serde(default)]
    pub supports_structured_output: bool,
    #[serde(default)]
    pub cost_tier: CostTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl BackendConfig {
    pub fn new(model: impl Into<String>, api_key_env: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            model: model.into(),
            base_url: None,
            api_key_env: api_key_env.into(),
            supports_structured_output: false,
            cost_tier: CostTier::default(),
            timeout_secs: None,
        }
    }

    pub fn backend_id(&self) -> &str {
        if self.id.is_empty() {
            &self.model
        } else {
            &self.id
        }
    }

    pub fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::new(self.backend_id())
            .structured(self.supports_structured_output)
            .cost_tier(self.cost_tier)
    }
}

fn gemini_backend(model: &str, cost_tier: CostTier) -> BackendConfig {
    BackendConfig {
        base_url: Some("https://generativelanguage.googleapis.com/v1beta/openai".to_string()),
        supports_structured_output: true,
        cost_tier,
        ..BackendConfig::new(model, "GEMINI_API_KEY")
    }
}

fn default_backends() -> Vec<BackendConfig> {
    vec![
        gemini_backend("gemini-2.0-flash", CostTier::Low),
        gemini_backend("gemini-2.0-flash-lite", CostTier::Low),
        gemini_backend("gemini-1.5-flash", CostTier::Standard),
    ]
}

/// Vault tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    #[serde(flatten)]
    pub policy: ColumnPolicy,
    /// Run the built-in pattern recognizer on free text
    #[serde(default = "default_true")]
    pub recognizer: bool,
}

fn default_true() -> bool {
    true
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            policy: ColumnPolicy::default(),
            recognizer: true,
        }
    }
}

/// Session storage backend type
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process only
    #[default]
    Memory,
    /// JSON files under `sessionsDir`
    File,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions_dir: Option<PathBuf>,
    /// Environment variable holding a base64 AES-256 key; records are sealed when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealing_key_env: Option<String>,
}

impl StorageConfig {
    pub fn sessions_dir(&self) -> PathBuf {
        self.sessions_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".a3s/insight/sessions"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationConfig {
    /// Detect non-English queries and translate through the dispatcher
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: TranslationMode,
}

/// Configuration for a3s-insight
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightConfig {
    /// Ordered backend preference list
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            backends: default_backends(),
            dispatch: DispatchConfig::default(),
            vault: VaultConfig::default(),
            execution: ExecutionConfig::default(),
            pipeline: PipelineConfig::default(),
            storage: StorageConfig::default(),
            translation: TranslationConfig::default(),
        }
    }
}

impl InsightConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            InsightError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            InsightError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Save configuration to a JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                InsightError::Config(format!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| {
            InsightError::Config(format!("Failed to write config file {}: {}", path.display(), e))
        })
    }

    /// Build the dispatcher; backends whose key variable is unset are skipped
    pub fn build_dispatcher(&self) -> CallDispatcher {
        let mut dispatcher = CallDispatcher::new(self.dispatch.clone());
        for backend in &self.backends {
            let Ok(api_key) = std::env::var(&backend.api_key_env) else {
                tracing::warn!(
                    backend = %backend.backend_id(),
                    env = %backend.api_key_env,
                    "API key not set, backend skipped"
                );
                continue;
            };

            let mut client = ChatCompletionsBackend::new(api_key, &backend.model);
            if let Some(url) = &backend.base_url {
                client = client.with_base_url(url);
            }
            if let Some(secs) = backend.timeout_secs {
                client = client.with_timeout(Duration::from_secs(secs));
            }
            dispatcher = dispatcher.with_backend(backend.descriptor(), Arc::new(client));
        }
        dispatcher
    }

    pub fn build_store(&self) -> Result<Arc<dyn SessionStore>> {
        match self.storage.backend {
            StorageBackend::Memory => Ok(Arc::new(MemorySessionStore::default())),
            StorageBackend::File => {
                let mut store = FileSessionStore::new(self.storage.sessions_dir());
                if let Some(var) = &self.storage.sealing_key_env {
                    store = store.with_sealer(Arc::new(Aes256GcmSealer::from_env(SEALING_KEY_ID, var)?));
                }
                Ok(Arc::new(store))
            }
        }
    }

    pub fn build_engine(&self) -> TokenizationEngine {
        let engine = TokenizationEngine::new(self.vault.policy.clone());
        if self.vault.recognizer {
            engine.with_recognizer(Arc::new(RegexRecognizer::default()))
        } else {
            engine
        }
    }

    pub fn build_translator(&self, dispatcher: Arc<CallDispatcher>) -> Arc<dyn Translator> {
        if self.translation.enabled {
            Arc::new(DispatchTranslator::new(dispatcher))
        } else {
            Arc::new(PassthroughTranslator)
        }
    }
}
