//! # a3s-insight
//!
//! Privacy-preserving question answering over uploaded datasets.
//!
//! ## Overview
//!
//! A user uploads a table or a document and asks questions about it. A
//! language model writes Lua analysis code, the code runs in a sandbox
//! against the data, and the user gets an answer. Sensitive values are
//! swapped for `<KIND_n>` tokens before anything is sent to a model and
//! swapped back afterwards, so the model provider only ever sees tokens.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_insight::{AskRequest, InsightConfig, RequestOrchestrator};
//!
//! # async fn example() -> a3s_insight::Result<()> {
//! let orchestrator = RequestOrchestrator::from_config(&InsightConfig::default())?;
//!
//! let receipt = orchestrator
//!     .upload("sales.csv", b"id,country\n1,France\n2,Spain\n")
//!     .await?;
//!
//! let reply = orchestrator
//!     .ask(AskRequest::new("How many sales went to France?").in_session(&receipt.session_id))
//!     .await;
//! println!("{}", reply.answer);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **vault**: `EntityMap` and `TokenizationEngine`: ingest, protect, restore
//! - **dispatch**: `CallDispatcher` over an ordered list of `ModelBackend`s
//! - **analyst**: `CodeSynthesisPipeline` and the sandboxed `LuaExecutor`
//! - **orchestrator**: `RequestOrchestrator`, the only caller of the above
//! - **store** / **session**: durable `SessionStore` and the in-process cache
//! - **translate**: optional query/answer translation on masked text

pub mod analyst;
pub mod config;
pub mod crypto;
pub mod dataset;
pub mod dispatch;
pub mod error;
pub mod loader;
pub mod orchestrator;
pub mod session;
pub mod store;
pub mod translate;
pub mod vault;

// Re-export core types
pub use analyst::{
    AnalysisOutcome, CodeExecutor, CodeSynthesisPipeline, ExecutionConfig, ExecutionError,
    ExecutionOutput, HealRegistry, HealRule, LuaExecutor, PipelineConfig,
};
pub use config::{BackendConfig, InsightConfig, StorageBackend};
pub use crypto::{Aes256GcmSealer, RecordSealer};
pub use dataset::{CellValue, Dataset, DatasetKind, Table};
pub use dispatch::{
    BackendDescriptor, BackendError, CallDispatcher, ChatCompletionsBackend, CostTier,
    DispatchConfig, ModelBackend, DEGRADED_MESSAGE,
};
pub use error::{InsightError, Result};
pub use loader::{DatasetLoader, StandardLoader};
pub use orchestrator::{AgentKind, AskRequest, Reply, RequestOrchestrator, UploadReceipt};
pub use session::{SessionCache, SessionContext};
pub use store::{FileSessionStore, MemorySessionStore, Role, SessionStore, StoredMessage};
pub use translate::{DispatchTranslator, PassthroughTranslator, TranslationMode, Translator};
pub use vault::{ColumnPolicy, EntityMap, EntityRecognizer, RegexRecognizer, TokenizationEngine};
