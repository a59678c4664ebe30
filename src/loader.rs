//! Upload parsing
//!
//! Extension decides the format: `.csv` and `.json` become tables, `.txt`
//! and `.md` become documents. Anything else is `UnsupportedFormat`, kept
//! distinct from `Parse` so callers can tell "wrong kind of file" from
//! "broken file".

use crate::dataset::{CellValue, Dataset, Table};
use crate::error::{InsightError, Result};
use std::path::Path;

/// Turns uploaded bytes into a dataset
pub trait DatasetLoader: Send + Sync {
    fn load(&self, filename: &str, bytes: &[u8]) -> Result<Dataset>;
}

/// Loader for csv, json, txt and md uploads
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardLoader;

fn parse_err(filename: &str, reason: impl std::fmt::Display) -> InsightError {
    InsightError::Parse {
        filename: filename.to_string(),
        reason: reason.to_string(),
    }
}

fn utf8<'a>(filename: &str, bytes: &'a [u8]) -> Result<&'a str> {
    let text = std::str::from_utf8(bytes).map_err(|e| parse_err(filename, e))?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

fn load_csv(filename: &str, bytes: &[u8]) -> Result<Table> {
    let text = utf8(filename, bytes)?;
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| parse_err(filename, e))?
        .iter()
        .enumerate()
        .map(|(i, h)| if h.is_empty() { format!("column_{}", i + 1) } else { h.to_string() })
        .collect();
    if headers.is_empty() {
        return Err(parse_err(filename, "missing header row"));
    }

    let mut table = Table::new(headers);
    for record in reader.records() {
        let record = record.map_err(|e| parse_err(filename, e))?;
        table.push_row(record.iter().map(CellValue::infer).collect());
    }
    Ok(table)
}

fn json_cell(value: &serde_json::Value) -> CellValue {
    use serde_json::Value;
    match value {
        Value::Null => CellValue::Null,
        Value::Bool(b) => CellValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => CellValue::Int(i),
            None => n.as_f64().map(CellValue::Float).unwrap_or(CellValue::Null),
        },
        Value::String(s) => CellValue::Text(s.clone()),
        other => CellValue::Text(other.to_string()),
    }
}

fn load_json(filename: &str, bytes: &[u8]) -> Result<Table> {
    let text = utf8(filename, bytes)?;
    let doc: serde_json::Value = serde_json::from_str(text).map_err(|e| parse_err(filename, e))?;
    let records = match doc {
        serde_json::Value::Array(items) => items,
        obj @ serde_json::Value::Object(_) => vec![obj],
        _ => return Err(parse_err(filename, "expected an array of records")),
    };

    let mut columns: Vec<String> = Vec::new();
    for record in &records {
        let obj = record
            .as_object()
            .ok_or_else(|| parse_err(filename, "every record must be an object"))?;
        for key in obj.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }

    let mut table = Table::new(columns.clone());
    for record in &records {
        let row = columns
            .iter()
            .map(|c| record.get(c).map(json_cell).unwrap_or(CellValue::Null))
            .collect();
        table.push_row(row);
    }
    Ok(table)
}

impl DatasetLoader for StandardLoader {
    fn load(&self, filename: &str, bytes: &[u8]) -> Result<Dataset> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let dataset = match ext.as_str() {
            "csv" => Dataset::Structured(load_csv(filename, bytes)?),
            "json" => Dataset::Structured(load_json(filename, bytes)?),
            "txt" | "md" => Dataset::Unstructured(utf8(filename, bytes)?.to_string()),
            _ => return Err(InsightError::UnsupportedFormat(filename.to_string())),
        };
        tracing::debug!(file = %filename, kind = %dataset.kind(), "Upload parsed");
        Ok(dataset)
    }
}
