//! Sandboxed execution of generated analysis code
//!
//! Each run gets a fresh interpreter with a fixed binding set: `df` (the
//! masked table), `result` and `chart_data` (both nil), and a captured
//! `print`. Host access (`os`, `io`, `debug`, module loading, dynamic
//! `load`) is removed. Runs are bounded by wall-clock time, an instruction
//! budget and a memory ceiling.

use super::frame::Frame;
use crate::dataset::Table;
use mlua::{HookTriggers, Lua, LuaSerdeExt, MultiValue, Value, VmState};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Instructions between hook checks
const HOOK_INTERVAL: u32 = 10_000;

/// Cap on captured `print` lines
const MAX_OUTPUT_LINES: usize = 5_000;

/// Bounds and options for one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_instruction_limit")]
    pub instruction_limit: u64,
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: usize,
    /// Enable the optional `df:to_markdown()` formatter
    #[serde(default)]
    pub markdown_tables: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_instruction_limit() -> u64 {
    100_000_000
}

fn default_memory_limit() -> usize {
    256 * 1024 * 1024
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            instruction_limit: default_instruction_limit(),
            memory_limit_bytes: default_memory_limit(),
            markdown_tables: false,
        }
    }
}

/// Why a script did not produce a result
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("{0}")]
    Runtime(String),

    #[error("execution timeout ({0}s limit)")]
    Timeout(u64),

    #[error("instruction limit exceeded ({0} instructions)")]
    InstructionLimit(u64),

    #[error("memory limit exceeded")]
    Memory,

    #[error("sandbox setup failed: {0}")]
    Setup(String),
}

/// What a successful run produced
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecutionOutput {
    /// `result` rendered as text; captured output when `result` was unset
    pub result: String,
    /// `chart_data` converted to JSON, when set
    pub chart_data: Option<serde_json::Value>,
    /// Captured `print` lines
    pub stdout: Vec<String>,
}

/// Capability-scoped evaluator for generated code
pub trait CodeExecutor: Send + Sync {
    /// Compile without running
    fn check_syntax(&self, code: &str) -> Result<(), ExecutionError>;

    /// Run against a table bound as `df`
    fn execute(&self, code: &str, table: &Table) -> Result<ExecutionOutput, ExecutionError>;
}

/// Lua 5.4 executor
#[derive(Debug, Clone, Default)]
pub struct LuaExecutor {
    config: ExecutionConfig,
}

impl LuaExecutor {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    fn sandbox(&self, output: Rc<RefCell<Vec<String>>>) -> mlua::Result<Lua> {
        let lua = Lua::new();
        lua.set_memory_limit(self.config.memory_limit_bytes)?;

        let print_fn = lua.create_function(move |_, args: MultiValue| {
            let line = args
                .iter()
                .map(lua_value_to_string)
                .collect::<Vec<_>>()
                .join("\t");
            let mut lines = output.borrow_mut();
            if lines.len() < MAX_OUTPUT_LINES {
                lines.push(line);
            }
            Ok(())
        })?;

        let globals = lua.globals();
        globals.set("print", print_fn)?;
        for name in ["os", "io", "debug", "package", "require", "loadfile", "dofile", "load"] {
            globals.set(name, Value::Nil)?;
        }
        globals.set("result", Value::Nil)?;
        globals.set("chart_data", Value::Nil)?;
        Ok(lua)
    }
}

impl CodeExecutor for LuaExecutor {
    fn check_syntax(&self, code: &str) -> Result<(), ExecutionError> {
        let lua = Lua::new();
        lua.load(code)
            .set_name("analysis")
            .into_function()
            .map(|_| ())
            .map_err(|e| ExecutionError::Syntax(format_lua_error(&e)))
    }

    fn execute(&self, code: &str, table: &Table) -> Result<ExecutionOutput, ExecutionError> {
        let output = Rc::new(RefCell::new(Vec::new()));
        let lua = self
            .sandbox(output.clone())
            .map_err(|e| ExecutionError::Setup(e.to_string()))?;
        lua.globals()
            .set("df", Frame::new(table.clone(), self.config.markdown_tables))
            .map_err(|e| ExecutionError::Setup(e.to_string()))?;

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let limit = self.config.instruction_limit;
        let start = Instant::now();
        let budget = Arc::new(AtomicI64::new(i64::try_from(limit).unwrap_or(i64::MAX)));
        let timed_out = Arc::new(AtomicBool::new(false));
        {
            let budget = budget.clone();
            let timed_out = timed_out.clone();
            lua.set_hook(
                HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
                move |_lua, _debug| {
                    if start.elapsed() > timeout {
                        timed_out.store(true, Ordering::Relaxed);
                        return Err(mlua::Error::RuntimeError("execution timeout".to_string()));
                    }
                    let remaining = budget.fetch_sub(HOOK_INTERVAL as i64, Ordering::Relaxed);
                    if remaining <= HOOK_INTERVAL as i64 {
                        budget.store(0, Ordering::Relaxed);
                        Err(mlua::Error::RuntimeError("instruction limit exceeded".to_string()))
                    } else {
                        Ok(VmState::Continue)
                    }
                },
            );
        }

        let run = lua.load(code).set_name("analysis").exec();
        lua.remove_hook();

        if let Err(e) = run {
            if timed_out.load(Ordering::Relaxed) {
                return Err(ExecutionError::Timeout(self.config.timeout_secs));
            }
            if budget.load(Ordering::Relaxed) <= 0 {
                return Err(ExecutionError::InstructionLimit(limit));
            }
            return Err(classify_lua_error(&e));
        }

        let stdout = output.borrow().clone();
        let globals = lua.globals();
        let result_value: Value = globals
            .get("result")
            .map_err(|e| ExecutionError::Runtime(format_lua_error(&e)))?;
        let result = match result_value {
            Value::Nil => stdout.join("\n"),
            other => render_result(&other),
        };

        let chart_value: Value = globals
            .get("chart_data")
            .map_err(|e| ExecutionError::Runtime(format_lua_error(&e)))?;
        let chart_data = match chart_value {
            Value::Nil => None,
            other => match lua.from_value::<serde_json::Value>(other) {
                Ok(json) => Some(json),
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding chart_data that is not JSON-shaped");
                    None
                }
            },
        };

        Ok(ExecutionOutput {
            result,
            chart_data,
            stdout,
        })
    }
}

fn classify_lua_error(error: &mlua::Error) -> ExecutionError {
    match error {
        mlua::Error::MemoryError(_) => ExecutionError::Memory,
        mlua::Error::SyntaxError { .. } => ExecutionError::Syntax(format_lua_error(error)),
        mlua::Error::CallbackError { cause, .. } => classify_lua_error(cause),
        _ => ExecutionError::Runtime(format_lua_error(error)),
    }
}

/// Render the `result` global as answer text
fn render_result(value: &Value) -> String {
    match value {
        Value::UserData(ud) => match ud.borrow::<Frame>() {
            Ok(frame) => frame.table().render_plain(),
            Err(_) => "userdata".to_string(),
        },
        Value::Table(t) => {
            let items: Vec<Value> = t.clone().sequence_values::<Value>().filter_map(|v| v.ok()).collect();
            let scalar_list = !items.is_empty()
                && items.len() == t.raw_len()
                && items.iter().all(|v| {
                    matches!(
                        v,
                        Value::String(_) | Value::Integer(_) | Value::Number(_) | Value::Boolean(_)
                    )
                });
            if scalar_list {
                items.iter().map(lua_value_to_string).collect::<Vec<_>>().join("\n")
            } else {
                serde_json::to_string_pretty(&t)
                    .unwrap_or_else(|_| "table".to_string())
            }
        }
        other => lua_value_to_string(other),
    }
}

fn lua_value_to_string(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{:.1}", n)
            } else {
                format!("{}", n)
            }
        }
        Value::String(s) => s.to_string_lossy(),
        Value::Table(_) => "table".to_string(),
        Value::Function(_) => "function".to_string(),
        Value::UserData(ud) => match ud.borrow::<Frame>() {
            Ok(frame) => frame.table().render_plain(),
            Err(_) => "userdata".to_string(),
        },
        Value::Error(e) => format!("error: {}", e),
        _ => "<unknown>".to_string(),
    }
}

/// Strip interpreter chunk prefixes, unwrap callback errors
fn format_lua_error(error: &mlua::Error) -> String {
    match error {
        mlua::Error::SyntaxError { message, .. } => strip_chunk_prefix(message),
        mlua::Error::RuntimeError(msg) => strip_chunk_prefix(msg),
        mlua::Error::CallbackError { cause, .. } => format_lua_error(cause),
        _ => error.to_string(),
    }
}

fn strip_chunk_prefix(message: &str) -> String {
    let first = message.lines().next().unwrap_or(message);
    match first.find("]:") {
        Some(idx) => {
            let rest = &first[idx + 2..];
            // Skip the line number
            match rest.find(": ") {
                Some(colon) if rest[..colon].chars().all(|c| c.is_ascii_digit()) => {
                    rest[colon + 2..].to_string()
                }
                _ => rest.trim().to_string(),
            }
        }
        None => first.to_string(),
    }
}
