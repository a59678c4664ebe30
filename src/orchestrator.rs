//! Request orchestration
//!
//! The only component that talks to all the others. A query holds its
//! session's lock for the whole round trip:
//!
//! ```text
//! protect → translate → analyst | document | conversation → translate back → restore
//! ```
//!
//! Nothing past `protect` sees a cleartext entity, and `ask` never fails:
//! unexpected errors become a `System Error:` reply.

use crate::analyst::{prompt, CodeSynthesisPipeline, LuaExecutor};
use crate::config::InsightConfig;
use crate::dataset::{Dataset, DatasetKind};
use crate::dispatch::CallDispatcher;
use crate::error::{InsightError, Result};
use crate::loader::{DatasetLoader, StandardLoader};
use crate::session::{SessionCache, SessionContext, SessionHandle};
use crate::store::{Role, SessionStore, SessionSummary, StoredMessage};
use crate::translate::{PassthroughTranslator, TranslationMode, Translator};
use crate::vault::engine::{SCORE_PROTECTED, SCORE_UNAVAILABLE};
use crate::vault::{EntityMap, TokenizationEngine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Which part of the system produced a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentKind {
    /// Upload and masking
    Vault,
    /// Analysis over an uploaded dataset
    Analyst,
    /// Conversation without a dataset
    Liaison,
    /// Unexpected failure
    System,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Vault => "Vault",
            Self::Analyst => "Analyst",
            Self::Liaison => "Liaison",
            Self::System => "System",
        };
        f.write_str(name)
    }
}

/// Result of a successful upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub session_id: String,
    pub filename: String,
    pub kind: DatasetKind,
    /// Row count for tables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    pub tokenized_columns: Vec<String>,
    pub skipped_columns: Vec<String>,
    /// Entities registered in the new session's map
    pub entities: usize,
    pub message: String,
    pub privacy_score: u8,
}

/// One user query
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    pub text: String,
    /// Omitted for a fresh conversation
    #[serde(default)]
    pub session_id: Option<String>,
    /// Falls back to the orchestrator's configured mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation_mode: Option<TranslationMode>,
}

impl AskRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: None,
            translation_mode: None,
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_mode(mut self, mode: TranslationMode) -> Self {
        self.translation_mode = Some(mode);
        self
    }
}

/// Answer delivered to the user, entities restored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<serde_json::Value>,
    /// Empty when the request failed before a session existed
    pub session_id: String,
    pub agent: AgentKind,
    pub privacy_score: u8,
}

const TITLE_CHARS: usize = 40;

fn system_error(session_id: String, error: &InsightError) -> Reply {
    Reply {
        answer: format!("System Error: {}", error),
        chart: None,
        session_id,
        agent: AgentKind::System,
        privacy_score: SCORE_UNAVAILABLE,
    }
}

fn conversation_title(query: &str) -> String {
    let title: String = query.trim().chars().take(TITLE_CHARS).collect();
    if title.is_empty() {
        "New conversation".to_string()
    } else {
        title
    }
}

/// Entry point for uploads and queries
pub struct RequestOrchestrator {
    engine: TokenizationEngine,
    dispatcher: Arc<CallDispatcher>,
    pipeline: CodeSynthesisPipeline,
    translator: Arc<dyn Translator>,
    translation_mode: TranslationMode,
    loader: Arc<dyn DatasetLoader>,
    sessions: SessionCache,
}

impl RequestOrchestrator {
    pub fn new(
        engine: TokenizationEngine,
        dispatcher: Arc<CallDispatcher>,
        pipeline: CodeSynthesisPipeline,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            engine,
            dispatcher,
            pipeline,
            translator: Arc::new(PassthroughTranslator),
            translation_mode: TranslationMode::default(),
            loader: Arc::new(StandardLoader),
            sessions: SessionCache::new(store),
        }
    }

    /// Wire every component from configuration
    pub fn from_config(config: &InsightConfig) -> Result<Self> {
        let dispatcher = Arc::new(config.build_dispatcher());
        if dispatcher.is_empty() {
            tracing::warn!("No model backends available; queries will report a system error");
        }
        let executor = Arc::new(LuaExecutor::new(config.execution.clone()));
        let pipeline = CodeSynthesisPipeline::new(dispatcher.clone(), executor, config.pipeline.clone())
            .with_markdown_tables(config.execution.markdown_tables);

        Ok(Self::new(config.build_engine(), dispatcher.clone(), pipeline, config.build_store()?)
            .with_translator(config.build_translator(dispatcher))
            .with_translation_mode(config.translation.mode))
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = translator;
        self
    }

    /// Mode used when a request does not name one
    pub fn with_translation_mode(mut self, mode: TranslationMode) -> Self {
        self.translation_mode = mode;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn DatasetLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    /// Parse, mask and persist an upload as a new session
    pub async fn upload(&self, filename: &str, bytes: &[u8]) -> Result<UploadReceipt> {
        let dataset = self.loader.load(filename, bytes)?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut map = EntityMap::new();

        let (masked, rows, tokenized_columns, skipped_columns) = match dataset {
            Dataset::Structured(table) => {
                let ingested = self.engine.ingest(&table, &mut map);
                let rows = ingested.masked.nrows();
                (
                    Dataset::Structured(ingested.masked),
                    Some(rows),
                    ingested.tokenized_columns,
                    ingested.skipped_columns,
                )
            }
            Dataset::Unstructured(text) => {
                let protected = self.engine.protect(&text, Some(&mut map));
                (Dataset::Unstructured(protected.text), None, Vec::new(), Vec::new())
            }
        };

        let kind = masked.kind();
        let entities = map.len();
        let mut context = SessionContext::new(&session_id, filename);
        context.entity_map = Some(map);
        context.dataset = Some(Arc::new(masked));
        context.filename = Some(filename.to_string());
        self.sessions.create(context).await?;

        let message = format!("✅ **{}** loaded & secured.\nReady for analysis.", filename);
        self.sessions.append_message(
            &session_id,
            &StoredMessage::new(Role::Assistant, &message).with_metadata(serde_json::json!({
                "agent": AgentKind::Vault,
                "privacyScore": SCORE_PROTECTED,
            })),
        )?;

        tracing::info!(
            session = %session_id,
            file = %filename,
            kind = %kind,
            entities,
            "Upload secured"
        );

        Ok(UploadReceipt {
            session_id,
            filename: filename.to_string(),
            kind,
            rows,
            tokenized_columns,
            skipped_columns,
            entities,
            message,
            privacy_score: SCORE_PROTECTED,
        })
    }

    /// Answer one query; failures become a `System Error:` reply
    ///
    /// Once a session exists the exchange is always logged, failed or not.
    pub async fn ask(&self, request: AskRequest) -> Reply {
        let handle = match self.open_or_create(&request).await {
            Ok(handle) => handle,
            Err(e) => {
                let session_id = request.session_id.clone().unwrap_or_default();
                tracing::error!(session = %session_id, error = %e, "Query failed");
                return system_error(session_id, &e);
            }
        };
        let mut ctx = handle.lock().await;
        let mode = request.translation_mode.unwrap_or(self.translation_mode);

        let protected = self.engine.protect(&request.text, ctx.entity_map.as_mut());
        tracing::debug!(
            session = %ctx.session_id,
            score = protected.score,
            substitutions = protected.substitutions,
            "Query protected"
        );

        let translation = self.translator.detect_and_translate(&protected.text).await;

        let mut reply = match self.answer(ctx.dataset.clone(), &translation.english).await {
            Ok((agent, answer, chart)) => {
                let answer = self
                    .translator
                    .translate_back(&answer, &translation.language, mode)
                    .await;
                Reply {
                    answer,
                    chart,
                    session_id: ctx.session_id.clone(),
                    agent,
                    privacy_score: protected.score,
                }
            }
            Err(e) => {
                tracing::error!(session = %ctx.session_id, error = %e, "Query failed");
                system_error(ctx.session_id.clone(), &e)
            }
        };

        let map = ctx.entity_map.as_ref();
        reply.answer = self.engine.restore(&reply.answer, map);
        reply.chart = reply.chart.map(|c| self.engine.restore_json(&c, map));

        let exchange = [
            StoredMessage::new(Role::User, &request.text),
            StoredMessage::new(Role::Assistant, &reply.answer).with_metadata(serde_json::json!({
                "agent": reply.agent,
                "language": translation.language,
                "mode": mode,
                "privacyScore": reply.privacy_score,
            })),
        ];
        if let Err(e) = self.sessions.commit(&ctx, &exchange).await {
            tracing::error!(session = %ctx.session_id, error = %e, "Failed to record query");
            return system_error(ctx.session_id.clone(), &e);
        }

        tracing::info!(session = %ctx.session_id, agent = %reply.agent, "Query answered");
        reply
    }

    async fn open_or_create(&self, request: &AskRequest) -> Result<SessionHandle> {
        match &request.session_id {
            Some(id) => self.sessions.open(id).await,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                self.sessions
                    .create(SessionContext::new(id, conversation_title(&request.text)))
                    .await
            }
        }
    }

    /// Analyst over a dataset, liaison without one
    async fn answer(
        &self,
        dataset: Option<Arc<Dataset>>,
        query: &str,
    ) -> Result<(AgentKind, String, Option<serde_json::Value>)> {
        match dataset {
            Some(dataset) => {
                let (answer, chart) = self.pipeline.analyze(dataset, query).await?.into_reply();
                Ok((AgentKind::Analyst, answer, chart))
            }
            None => {
                let answer = self
                    .dispatcher
                    .dispatch(&prompt::conversation_prompt(query), false)
                    .await?;
                Ok((AgentKind::Liaison, answer, None))
            }
        }
    }

    /// Message log of a session, oldest first
    pub fn messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        self.sessions.messages(session_id)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        self.sessions.store().list()
    }

    /// Remove a session, its map, dataset and messages
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.sessions.delete(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyst::PipelineConfig;
    use crate::dispatch::testing::{fast_config, ScriptedBackend};
    use crate::dispatch::{BackendDescriptor, BackendError};
    use crate::store::MemorySessionStore;

    fn orchestrator(backend: Arc<ScriptedBackend>) -> RequestOrchestrator {
        let dispatcher = Arc::new(CallDispatcher::new(fast_config()).with_backend(BackendDescriptor::new("m"), backend));
        let pipeline = CodeSynthesisPipeline::new(
            dispatcher.clone(),
            Arc::new(LuaExecutor::default()),
            PipelineConfig {
                polish: false,
                ..Default::default()
            },
        );
        RequestOrchestrator::new(
            TokenizationEngine::default(),
            dispatcher,
            pipeline,
            Arc::new(MemorySessionStore::default()),
        )
    }

    const CSV: &[u8] = b"id,country\n1,France\n2,Spain\n3,France\n";

    #[tokio::test]
    async fn test_upload_masks_and_logs() {
        let o = orchestrator(Arc::new(ScriptedBackend::answering(&[])));
        let receipt = o.upload("sales.csv", CSV).await.unwrap();
        assert_eq!(receipt.kind, DatasetKind::Structured);
        assert_eq!(receipt.rows, Some(3));
        assert_eq!(receipt.tokenized_columns, vec!["country".to_string()]);
        assert_eq!(receipt.entities, 2);
        assert_eq!(receipt.message, "✅ **sales.csv** loaded & secured.\nReady for analysis.");

        let messages = o.messages(&receipt.session_id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].metadata.as_ref().unwrap()["agent"], "Vault");
    }

    #[tokio::test]
    async fn test_upload_rejects_unknown_format() {
        let o = orchestrator(Arc::new(ScriptedBackend::answering(&[])));
        assert!(matches!(
            o.upload("deck.pptx", b"x").await,
            Err(InsightError::UnsupportedFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_ask_masks_outbound_and_restores_answer() {
        let backend = Arc::new(ScriptedBackend::answering(&[
            "```lua\nresult = #df:where('country', '<COUN_1>') .. ' rows for <COUN_1>'\n```",
        ]));
        let o = orchestrator(backend.clone());
        let receipt = o.upload("sales.csv", CSV).await.unwrap();

        let reply = o
            .ask(AskRequest::new("How many rows for France?").in_session(&receipt.session_id))
            .await;
        assert_eq!(reply.answer, "2 rows for France");
        assert_eq!(reply.agent, AgentKind::Analyst);
        assert_eq!(reply.privacy_score, SCORE_PROTECTED);

        let (prompt, _) = &backend.calls()[0];
        assert!(!prompt.contains("France"));
        assert!(prompt.contains("<COUN_1>"));

        let messages = o.messages(&receipt.session_id).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[2].content, "2 rows for France");
    }

    #[tokio::test]
    async fn test_ask_without_session_is_conversation() {
        let backend = Arc::new(ScriptedBackend::answering(&["Hello! Upload a file to begin."]));
        let o = orchestrator(backend.clone());
        let reply = o.ask(AskRequest::new("hi there")).await;
        assert_eq!(reply.agent, AgentKind::Liaison);
        assert_eq!(reply.answer, "Hello! Upload a file to begin.");
        assert_eq!(reply.privacy_score, SCORE_UNAVAILABLE);
        assert_eq!(backend.calls()[0].0, "User Query: hi there");
        assert_eq!(o.messages(&reply.session_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_session_is_system_error() {
        let o = orchestrator(Arc::new(ScriptedBackend::answering(&[])));
        let reply = o.ask(AskRequest::new("q").in_session("missing")).await;
        assert_eq!(reply.agent, AgentKind::System);
        assert!(reply.answer.starts_with("System Error: "));
    }

    #[tokio::test]
    async fn test_delete_session() {
        let o = orchestrator(Arc::new(ScriptedBackend::answering(&[])));
        let receipt = o.upload("notes.txt", b"Call me at alice@example.com").await.unwrap();
        assert_eq!(receipt.kind, DatasetKind::Unstructured);
        assert_eq!(o.list_sessions().unwrap().len(), 1);
        assert!(o.delete_session(&receipt.session_id).await.unwrap());
        assert!(o.list_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_padded_csv_values_are_masked_in_any_position() {
        let backend = Arc::new(ScriptedBackend::answering(&["```lua\nresult = df:nrows()\n```"]));
        let o = orchestrator(backend.clone());
        let receipt = o.upload("sales.csv", b"id, country\n1, France\n2, Spain\n").await.unwrap();

        o.ask(AskRequest::new("France: how many rows?").in_session(&receipt.session_id))
            .await;
        let (prompt, _) = &backend.calls()[0];
        assert!(!prompt.contains("France"));
        assert!(prompt.contains("<COUN_1>: how many rows?"));
    }

    #[tokio::test]
    async fn test_failed_query_is_still_logged() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(BackendError::Other("bad request".into()))]));
        let o = orchestrator(backend);
        let receipt = o.upload("sales.csv", CSV).await.unwrap();

        let reply = o
            .ask(AskRequest::new("rows for France?").in_session(&receipt.session_id))
            .await;
        assert_eq!(reply.agent, AgentKind::System);
        assert_eq!(reply.session_id, receipt.session_id);

        let messages = o.messages(&receipt.session_id).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content, "rows for France?");
        assert_eq!(messages[2].content, reply.answer);
        assert_eq!(messages[2].metadata.as_ref().unwrap()["agent"], "System");
    }

    #[tokio::test]
    async fn test_delete_during_query_is_not_undone() {
        let o = orchestrator(Arc::new(ScriptedBackend::answering(&["hello"])));
        let reply = o.ask(AskRequest::new("hi")).await;
        let handle = o.sessions().open(&reply.session_id).await.unwrap();
        assert!(o.delete_session(&reply.session_id).await.unwrap());

        let ctx = handle.lock().await;
        assert!(!o.sessions().commit(&ctx, &[StoredMessage::new(Role::User, "late")]).await.unwrap());
        assert!(o.list_sessions().unwrap().is_empty());
        assert!(o.messages(&reply.session_id).unwrap().is_empty());
    }

    /// Passthrough that records the mode each answer was translated with
    #[derive(Default)]
    struct ModeRecorder(std::sync::Mutex<Vec<TranslationMode>>);

    #[async_trait::async_trait]
    impl Translator for ModeRecorder {
        async fn detect_and_translate(&self, masked_text: &str) -> crate::translate::Translation {
            crate::translate::Translation::english(masked_text)
        }

        async fn translate_back(&self, text: &str, _language: &str, mode: TranslationMode) -> String {
            self.0.lock().unwrap().push(mode);
            text.to_string()
        }
    }

    #[tokio::test]
    async fn test_configured_translation_mode_is_the_default() {
        let recorder = Arc::new(ModeRecorder::default());
        let o = orchestrator(Arc::new(ScriptedBackend::answering(&["a", "b"])))
            .with_translator(recorder.clone())
            .with_translation_mode(TranslationMode::Mirror);

        let reply = o.ask(AskRequest::new("hi")).await;
        o.ask(
            AskRequest::new("again")
                .in_session(&reply.session_id)
                .with_mode(TranslationMode::Mixed),
        )
        .await;
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![TranslationMode::Mirror, TranslationMode::Mixed]
        );
        let messages = o.messages(&reply.session_id).unwrap();
        assert_eq!(messages[1].metadata.as_ref().unwrap()["mode"], "mirror");
    }

    #[test]
    fn test_conversation_title() {
        assert_eq!(conversation_title("   "), "New conversation");
        assert_eq!(conversation_title(&"x".repeat(100)).len(), TITLE_CHARS);
    }
}
