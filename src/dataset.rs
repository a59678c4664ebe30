//! In-memory dataset handle
//!
//! A session holds one `Dataset`: either a typed table with named columns
//! or a plain text document. Only the masked form is ever persisted.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A single typed cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl CellValue {
    /// Infer a typed cell from a raw textual field
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Null;
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Self::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if f.is_finite() {
                return Self::Float(f);
            }
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "true" => Self::Bool(true),
            "false" => Self::Bool(false),
            _ => Self::Text(trimmed.to_string()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Total order used for sorting: nulls first, then bools, numbers, text
    pub fn compare(&self, other: &Self) -> Ordering {
        fn rank(v: &CellValue) -> u8 {
            match v {
                CellValue::Null => 0,
                CellValue::Bool(_) => 1,
                CellValue::Int(_) | CellValue::Float(_) => 2,
                CellValue::Text(_) => 3,
            }
        }
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => rank(a).cmp(&rank(b)),
            },
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NaN"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => {
                if x.fract() == 0.0 && x.abs() < 1e15 {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Inferred type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Empty,
    Bool,
    Int,
    Float,
    Text,
    Mixed,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "empty",
            Self::Bool => "bool",
            Self::Int => "int64",
            Self::Float => "float64",
            Self::Text => "text",
            Self::Mixed => "mixed",
        };
        write!(f, "{}", name)
    }
}

/// Tabular data with named columns and row-major typed cells
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<CellValue>>,
}

impl Table {
    /// Create an empty table with the given column names
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Build a table from columns and rows; short rows are padded with nulls
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<CellValue>>) -> Self {
        let mut table = Self {
            columns,
            rows: Vec::with_capacity(rows.len()),
        };
        for row in rows {
            table.push_row(row);
        }
        table
    }

    /// Append a row, padding or truncating it to the column count
    pub fn push_row(&mut self, mut row: Vec<CellValue>) {
        row.resize(self.columns.len(), CellValue::Null);
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [Vec<CellValue>] {
        &mut self.rows
    }

    pub fn nrows(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Iterate over the cells of one column
    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &CellValue> {
        self.rows.iter().filter_map(move |row| row.get(idx))
    }

    /// Infer the type of a column from its non-null cells
    pub fn column_type(&self, idx: usize) -> ColumnType {
        let mut seen = ColumnType::Empty;
        for cell in self.column_values(idx) {
            let t = match cell {
                CellValue::Null => continue,
                CellValue::Bool(_) => ColumnType::Bool,
                CellValue::Int(_) => ColumnType::Int,
                CellValue::Float(_) => ColumnType::Float,
                CellValue::Text(_) => ColumnType::Text,
            };
            seen = match (seen, t) {
                (ColumnType::Empty, t) => t,
                (a, b) if a == b => a,
                (ColumnType::Int, ColumnType::Float) | (ColumnType::Float, ColumnType::Int) => {
                    ColumnType::Float
                }
                _ => ColumnType::Mixed,
            };
        }
        seen
    }

    /// First `n` rows as a new table
    pub fn head(&self, n: usize) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Schema overview: shape, then one line per column with non-null count and dtype
    pub fn schema_summary(&self) -> String {
        let width = self
            .columns
            .iter()
            .map(|c| c.chars().count())
            .max()
            .unwrap_or(6)
            .max(6);
        let mut out = format!(
            "<Table: {} rows x {} columns>\n #   {:<width$}  Non-Null  Dtype\n",
            self.nrows(),
            self.columns.len(),
            "Column",
            width = width
        );
        for (idx, name) in self.columns.iter().enumerate() {
            let non_null = self.column_values(idx).filter(|c| !c.is_null()).count();
            out.push_str(&format!(
                " {:<3} {:<width$}  {:<8}  {}\n",
                idx,
                name,
                non_null,
                self.column_type(idx),
                width = width
            ));
        }
        out
    }

    /// Render as an aligned plain-text table, every row included
    pub fn render_plain(&self) -> String {
        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| row.iter().map(|c| c.to_string()).collect())
            .collect();
        let widths: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                cells
                    .iter()
                    .map(|r| r[i].chars().count())
                    .chain(std::iter::once(name.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let mut lines = Vec::with_capacity(cells.len() + 1);
        lines.push(pad_line(&self.columns, &widths));
        for row in &cells {
            lines.push(pad_line(row, &widths));
        }
        lines.join("\n")
    }

    /// Render as a GitHub-flavored markdown table
    pub fn render_markdown(&self) -> String {
        let mut out = format!("| {} |\n", self.columns.join(" | "));
        out.push_str(&format!(
            "|{}|\n",
            self.columns.iter().map(|_| " --- ").collect::<Vec<_>>().join("|")
        ));
        for row in &self.rows {
            let cells: Vec<String> = row
                .iter()
                .map(|c| c.to_string().replace('|', "\\|"))
                .collect();
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }
        out.trim_end().to_string()
    }
}

fn pad_line(cells: &[String], widths: &[usize]) -> String {
    cells
        .iter()
        .zip(widths)
        .map(|(c, w)| format!("{:<width$}", c, width = *w))
        .collect::<Vec<_>>()
        .join("  ")
        .trim_end()
        .to_string()
}

/// Kind tag for a dataset handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Structured,
    Unstructured,
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structured => write!(f, "structured"),
            Self::Unstructured => write!(f, "unstructured"),
        }
    }
}

/// Uploaded data owned by a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Dataset {
    Structured(Table),
    Unstructured(String),
}

impl Dataset {
    pub fn kind(&self) -> DatasetKind {
        match self {
            Self::Structured(_) => DatasetKind::Structured,
            Self::Unstructured(_) => DatasetKind::Unstructured,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::from_rows(
            vec!["id".into(), "country".into(), "score".into()],
            vec![
                vec![CellValue::Int(1), CellValue::Text("France".into()), CellValue::Float(1.5)],
                vec![CellValue::Int(2), CellValue::Text("Spain".into()), CellValue::Int(3)],
                vec![CellValue::Int(3), CellValue::Null],
            ],
        )
    }

    #[test]
    fn test_infer_cells() {
        assert_eq!(CellValue::infer("42"), CellValue::Int(42));
        assert_eq!(CellValue::infer("4.5"), CellValue::Float(4.5));
        assert_eq!(CellValue::infer("TRUE"), CellValue::Bool(true));
        assert_eq!(CellValue::infer("  "), CellValue::Null);
        assert_eq!(CellValue::infer("Paris"), CellValue::Text("Paris".into()));
        assert_eq!(CellValue::infer(" Paris "), CellValue::Text("Paris".into()));
        assert_eq!(CellValue::infer("nan"), CellValue::Text("nan".into()));
    }

    #[test]
    fn test_short_rows_padded() {
        let t = sample();
        assert_eq!(t.rows()[2].len(), 3);
        assert!(t.rows()[2][2].is_null());
    }

    #[test]
    fn test_column_types() {
        let t = sample();
        assert_eq!(t.column_type(0), ColumnType::Int);
        assert_eq!(t.column_type(1), ColumnType::Text);
        assert_eq!(t.column_type(2), ColumnType::Float);
    }

    #[test]
    fn test_schema_summary_lists_columns() {
        let summary = sample().schema_summary();
        assert!(summary.starts_with("<Table: 3 rows x 3 columns>"));
        assert!(summary.contains("country"));
        assert!(summary.contains("int64"));
    }

    #[test]
    fn test_render_plain_alignment() {
        let t = Table::from_rows(
            vec!["name".into(), "n".into()],
            vec![vec![CellValue::Text("Alexandria".into()), CellValue::Int(7)]],
        );
        let text = t.render_plain();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "name        n");
        assert_eq!(lines[1], "Alexandria  7");
    }

    #[test]
    fn test_render_markdown() {
        let t = sample().head(1);
        let md = t.render_markdown();
        assert_eq!(
            md,
            "| id | country | score |\n| --- | --- | --- |\n| 1 | France | 1.5 |"
        );
    }

    #[test]
    fn test_compare_orders_numbers_across_types() {
        assert_eq!(CellValue::Int(2).compare(&CellValue::Float(1.5)), Ordering::Greater);
        assert_eq!(CellValue::Null.compare(&CellValue::Int(0)), Ordering::Less);
    }

    #[test]
    fn test_dataset_serde_tagged() {
        let ds = Dataset::Unstructured("hello".into());
        let json = serde_json::to_value(&ds).unwrap();
        assert_eq!(json["kind"], "unstructured");
        let back: Dataset = serde_json::from_value(json).unwrap();
        assert_eq!(back, ds);
    }
}
