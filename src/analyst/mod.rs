//! Code-synthesis pipeline
//!
//! One query runs through
//! `BUILD_PROMPT → DISPATCH → EXTRACT → VALIDATE → EXECUTE →
//! {SELF_HEAL → EXECUTE_RETRY} → POLISH → DONE`. Every terminal condition
//! is an [`AnalysisOutcome`]; only unexpected failures (a backend error
//! that is not an availability problem, a crashed worker) are `Err`.

pub mod executor;
pub mod extract;
pub mod frame;
pub mod heal;
pub mod prompt;

pub use executor::{CodeExecutor, ExecutionConfig, ExecutionError, ExecutionOutput, LuaExecutor};
pub use heal::{HealRegistry, HealRule};

use crate::dataset::Dataset;
use crate::dispatch::{CallDispatcher, DEGRADED_MESSAGE};
use crate::error::{InsightError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Replaces an answer that is nothing but the chart payload
pub const CHART_CAPTION: &str = "📊 Chart generated from the analysis results.";

/// Answer used when the script set neither `result` nor printed anything
pub const EMPTY_RESULT: &str = "The analysis ran but produced no result.";

/// Pipeline states, traced at debug level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    BuildPrompt,
    Dispatch,
    Extract,
    Validate,
    Execute,
    SelfHeal,
    ExecuteRetry,
    Polish,
    Done,
    Error,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BuildPrompt => "BUILD_PROMPT",
            Self::Dispatch => "DISPATCH",
            Self::Extract => "EXTRACT",
            Self::Validate => "VALIDATE",
            Self::Execute => "EXECUTE",
            Self::SelfHeal => "SELF_HEAL",
            Self::ExecuteRetry => "EXECUTE_RETRY",
            Self::Polish => "POLISH",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Terminal result of one pipeline run
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Answer {
        text: String,
        chart: Option<serde_json::Value>,
        /// A heal rule rewrote the code before it succeeded
        healed: bool,
    },
    /// The response held no extractable code
    NoCode { raw: String },
    /// The extracted code failed the syntax check
    InvalidCode { reason: String },
    /// Execution failed (after at most one heal)
    CalculationError { message: String },
    /// Every backend was exhausted
    Degraded { message: String },
}

impl AnalysisOutcome {
    /// User-facing text and chart payload
    pub fn into_reply(self) -> (String, Option<serde_json::Value>) {
        match self {
            Self::Answer { text, chart, .. } => (text, chart),
            Self::NoCode { raw } => (format!("No code generated. Output: {}", raw), None),
            Self::InvalidCode { reason } => (
                format!("Error: Invalid analysis code generated. {}", reason),
                None,
            ),
            Self::CalculationError { message } => (format!("Calculation Error: {}", message), None),
            Self::Degraded { message } => (message, None),
        }
    }

    pub fn is_answer(&self) -> bool {
        matches!(self, Self::Answer { .. })
    }
}

/// Pipeline tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Rows of sample data shown to the model
    #[serde(default = "default_sample_rows")]
    pub sample_rows: usize,
    /// Run the second, presentation-only model call
    #[serde(default = "default_polish")]
    pub polish: bool,
    /// Chars of an unstructured document sent with the query
    #[serde(default = "default_document_prefix")]
    pub document_prefix_chars: usize,
}

fn default_sample_rows() -> usize {
    3
}

fn default_polish() -> bool {
    true
}

fn default_document_prefix() -> usize {
    15_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rows: default_sample_rows(),
            polish: default_polish(),
            document_prefix_chars: default_document_prefix(),
        }
    }
}

fn enter(stage: PipelineStage) {
    tracing::debug!(stage = %stage, "Pipeline transition");
}

fn is_raw_json(text: &str) -> bool {
    let trimmed = text.trim();
    (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
}

/// Turns a masked query into an answer over the masked dataset
pub struct CodeSynthesisPipeline {
    dispatcher: Arc<CallDispatcher>,
    executor: Arc<dyn CodeExecutor>,
    heal: HealRegistry,
    config: PipelineConfig,
    markdown_tables: bool,
}

impl CodeSynthesisPipeline {
    pub fn new(dispatcher: Arc<CallDispatcher>, executor: Arc<dyn CodeExecutor>, config: PipelineConfig) -> Self {
        Self {
            dispatcher,
            executor,
            heal: HealRegistry::default(),
            config,
            markdown_tables: false,
        }
    }

    pub fn with_heal_rules(mut self, heal: HealRegistry) -> Self {
        self.heal = heal;
        self
    }

    /// Advertise `df:to_markdown()` in prompts
    pub fn with_markdown_tables(mut self, enabled: bool) -> Self {
        self.markdown_tables = enabled;
        self
    }

    /// Route to the table or document path by dataset kind
    pub async fn analyze(&self, dataset: Arc<Dataset>, query: &str) -> Result<AnalysisOutcome> {
        match dataset.as_ref() {
            Dataset::Structured(_) => self.analyze_table(dataset, query).await,
            Dataset::Unstructured(text) => self.analyze_document(text, query).await,
        }
    }

    /// Full code-synthesis run; `dataset` must be structured
    pub async fn analyze_table(&self, dataset: Arc<Dataset>, query: &str) -> Result<AnalysisOutcome> {
        let Dataset::Structured(table) = dataset.as_ref() else {
            return Err(InsightError::Execution(
                "code synthesis needs a structured dataset".to_string(),
            ));
        };

        enter(PipelineStage::BuildPrompt);
        let prompt = prompt::analysis_prompt(table, query, self.config.sample_rows, self.markdown_tables);

        enter(PipelineStage::Dispatch);
        let response = match self.dispatcher.try_dispatch(&prompt, false).await {
            Ok(completion) => completion.text,
            Err(InsightError::BackendsExhausted { .. }) => {
                enter(PipelineStage::Error);
                return Ok(AnalysisOutcome::Degraded {
                    message: DEGRADED_MESSAGE.to_string(),
                });
            }
            Err(e) => {
                enter(PipelineStage::Error);
                return Err(e);
            }
        };

        enter(PipelineStage::Extract);
        let Some(code) = extract::extract_code(&response) else {
            enter(PipelineStage::Error);
            return Ok(AnalysisOutcome::NoCode { raw: response });
        };

        enter(PipelineStage::Validate);
        if let Err(e) = self.executor.check_syntax(&code) {
            tracing::info!(error = %e, "Generated code rejected");
            enter(PipelineStage::Error);
            return Ok(AnalysisOutcome::InvalidCode {
                reason: e.to_string(),
            });
        }

        enter(PipelineStage::Execute);
        let (output, healed) = match self.run(dataset.clone(), code.clone()).await? {
            Ok(output) => (output, false),
            Err(first) => {
                let message = first.to_string();
                let Some(rule) = self.heal.find(&message) else {
                    enter(PipelineStage::Error);
                    return Ok(AnalysisOutcome::CalculationError { message });
                };

                enter(PipelineStage::SelfHeal);
                tracing::info!(rule = rule.name, "Rewriting generated code");
                let rewritten = rule.apply(&code);

                enter(PipelineStage::ExecuteRetry);
                match self.run(dataset, rewritten).await? {
                    Ok(output) => (output, true),
                    Err(retry) => {
                        enter(PipelineStage::Error);
                        return Ok(AnalysisOutcome::CalculationError {
                            message: retry.to_string(),
                        });
                    }
                }
            }
        };

        let chart = output.chart_data;
        let mut text = if output.result.trim().is_empty() {
            EMPTY_RESULT.to_string()
        } else {
            output.result
        };

        if chart.is_some() && is_raw_json(&text) {
            text = CHART_CAPTION.to_string();
        } else if self.config.polish {
            enter(PipelineStage::Polish);
            match self
                .dispatcher
                .try_dispatch(&prompt::polish_prompt(query, &text), false)
                .await
            {
                Ok(completion) if !completion.text.trim().is_empty() => text = completion.text,
                Ok(_) => tracing::warn!("Polish returned empty text, keeping raw result"),
                Err(e) => tracing::warn!(error = %e, "Polish failed, keeping raw result"),
            }
            if chart.is_some() && is_raw_json(&text) {
                text = CHART_CAPTION.to_string();
            }
        }

        enter(PipelineStage::Done);
        Ok(AnalysisOutcome::Answer { text, chart, healed })
    }

    /// Single dispatch with a bounded document prefix
    pub async fn analyze_document(&self, document: &str, query: &str) -> Result<AnalysisOutcome> {
        let prompt = prompt::document_prompt(query, document, self.config.document_prefix_chars);
        let text = self.dispatcher.dispatch(&prompt, false).await?;
        if text == DEGRADED_MESSAGE {
            return Ok(AnalysisOutcome::Degraded { message: text });
        }
        Ok(AnalysisOutcome::Answer {
            text,
            chart: None,
            healed: false,
        })
    }

    /// Execute on a blocking worker
    async fn run(
        &self,
        dataset: Arc<Dataset>,
        code: String,
    ) -> Result<std::result::Result<ExecutionOutput, ExecutionError>> {
        let executor = self.executor.clone();
        tokio::task::spawn_blocking(move || match dataset.as_ref() {
            Dataset::Structured(table) => executor.execute(&code, table),
            Dataset::Unstructured(_) => Err(ExecutionError::Setup("no table bound".to_string())),
        })
        .await
        .map_err(|e| InsightError::Execution(format!("Executor task failed: {}", e)))
    }
}
