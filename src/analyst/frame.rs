//! The `df` object exposed to analysis scripts
//!
//! A read-only view over the session's masked table. Every transforming
//! method returns a new frame; the underlying table is never mutated.
//!
//! # API
//!
//! - `df:columns()` → array of column names
//! - `df:nrows()` / `#df` → row count
//! - `df:rows()` → array of `{column = value}` tables
//! - `df:column(name)` → array of values (nulls become `nil`)
//! - `df:head(n)` → first `n` rows (default 5)
//! - `df:filter(fn)` → rows for which `fn(row)` is truthy
//! - `df:where(col, value)` → rows whose `col` equals `value`
//! - `df:select({cols})` → subset of columns
//! - `df:sort_by(col, descending)` → sorted copy, nulls first
//! - `df:unique(col)` → distinct non-null values in encounter order
//! - `df:value_counts(col)` → frame of `{col, count}`, most frequent first
//! - `df:sum(col)`, `df:mean(col)`, `df:min(col)`, `df:max(col)`
//! - `df:group_by(key, value_col, "sum" | "mean" | "count")` → frame
//! - `df:to_string()` → aligned plain-text table, every row
//! - `df:to_markdown()` → markdown table (optional formatter)

use crate::dataset::{CellValue, Table};
use mlua::{Function, IntoLua, Lua, MetaMethod, UserData, UserDataMethods, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

/// Error text raised when the markdown formatter is disabled
pub const MISSING_MARKDOWN: &str =
    "missing optional table formatter 'markdown': call to_string() instead";

impl IntoLua for CellValue {
    fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
        Ok(match self {
            CellValue::Null => Value::Nil,
            CellValue::Bool(b) => Value::Boolean(b),
            CellValue::Int(i) => Value::Integer(i),
            CellValue::Float(f) => Value::Number(f),
            CellValue::Text(s) => Value::String(lua.create_string(&s)?),
        })
    }
}

/// Convert a Lua scalar back to a cell for comparisons
pub(crate) fn lua_to_cell(value: &Value) -> CellValue {
    match value {
        Value::Nil => CellValue::Null,
        Value::Boolean(b) => CellValue::Bool(*b),
        Value::Integer(i) => CellValue::Int(*i),
        Value::Number(n) => CellValue::Float(*n),
        Value::String(s) => CellValue::Text(s.to_string_lossy()),
        other => CellValue::Text(format!("{:?}", other)),
    }
}

/// Aggregation applied by `group_by`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggregate {
    Sum,
    Mean,
    Count,
}

impl Aggregate {
    fn parse(name: &str) -> mlua::Result<Self> {
        match name {
            "sum" => Ok(Self::Sum),
            "mean" | "avg" => Ok(Self::Mean),
            "count" => Ok(Self::Count),
            other => Err(mlua::Error::RuntimeError(format!(
                "unknown aggregation '{}': expected sum, mean or count",
                other
            ))),
        }
    }
}

/// Lua userdata wrapping a table
#[derive(Clone)]
pub struct Frame {
    table: Rc<Table>,
    markdown: bool,
}

impl Frame {
    pub fn new(table: Table, markdown: bool) -> Self {
        Self {
            table: Rc::new(table),
            markdown,
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    fn derive(&self, table: Table) -> Self {
        Self::new(table, self.markdown)
    }

    fn col(&self, name: &str) -> mlua::Result<usize> {
        self.table
            .column_index(name)
            .ok_or_else(|| mlua::Error::RuntimeError(format!("unknown column '{}'", name)))
    }

    fn row_to_lua(&self, lua: &Lua, row: &[CellValue]) -> mlua::Result<mlua::Table> {
        let t = lua.create_table()?;
        for (name, cell) in self.table.columns().iter().zip(row) {
            t.set(name.as_str(), cell.clone())?;
        }
        Ok(t)
    }

    fn numbers(&self, idx: usize) -> impl Iterator<Item = f64> + '_ {
        self.table.column_values(idx).filter_map(CellValue::as_f64)
    }

    fn with_rows(&self, rows: Vec<Vec<CellValue>>) -> Self {
        self.derive(Table::from_rows(self.table.columns().to_vec(), rows))
    }

    fn extreme(&self, idx: usize, want: Ordering) -> Option<CellValue> {
        self.table
            .column_values(idx)
            .filter(|c| !c.is_null())
            .fold(None, |best: Option<&CellValue>, c| match best {
                Some(b) if c.compare(b) != want => Some(b),
                _ => Some(c),
            })
            .cloned()
    }
}

impl UserData for Frame {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("columns", |lua, this, ()| {
            lua.create_sequence_from(this.table.columns().iter().cloned())
        });

        methods.add_method("nrows", |_, this, ()| Ok(this.table.nrows()));

        methods.add_meta_method(MetaMethod::Len, |_, this, ()| Ok(this.table.nrows()));

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.table.render_plain()));

        methods.add_method("rows", |lua, this, ()| {
            let out = lua.create_table()?;
            for (i, row) in this.table.rows().iter().enumerate() {
                out.set(i + 1, this.row_to_lua(lua, row)?)?;
            }
            Ok(out)
        });

        methods.add_method("column", |lua, this, name: String| {
            let idx = this.col(&name)?;
            let out = lua.create_table()?;
            for (i, cell) in this.table.column_values(idx).enumerate() {
                out.set(i + 1, cell.clone())?;
            }
            Ok(out)
        });

        methods.add_method("head", |_, this, n: Option<usize>| {
            Ok(this.derive(this.table.head(n.unwrap_or(5))))
        });

        methods.add_method("filter", |lua, this, predicate: Function| {
            let mut kept = Vec::new();
            for row in this.table.rows() {
                let keep: Value = predicate.call(this.row_to_lua(lua, row)?)?;
                if !matches!(keep, Value::Nil | Value::Boolean(false)) {
                    kept.push(row.clone());
                }
            }
            Ok(this.with_rows(kept))
        });

        methods.add_method("where", |_, this, (name, value): (String, Value)| {
            let idx = this.col(&name)?;
            let target = lua_to_cell(&value);
            let kept = this
                .table
                .rows()
                .iter()
                .filter(|row| row[idx].compare(&target) == Ordering::Equal)
                .cloned()
                .collect();
            Ok(this.with_rows(kept))
        });

        methods.add_method("select", |_, this, names: Vec<String>| {
            let indices = names
                .iter()
                .map(|n| this.col(n))
                .collect::<mlua::Result<Vec<_>>>()?;
            let rows = this
                .table
                .rows()
                .iter()
                .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
                .collect();
            Ok(this.derive(Table::from_rows(names, rows)))
        });

        methods.add_method("sort_by", |_, this, (name, descending): (String, Option<bool>)| {
            let idx = this.col(&name)?;
            let mut rows = this.table.rows().to_vec();
            rows.sort_by(|a, b| a[idx].compare(&b[idx]));
            if descending.unwrap_or(false) {
                rows.reverse();
            }
            Ok(this.with_rows(rows))
        });

        methods.add_method("unique", |lua, this, name: String| {
            let idx = this.col(&name)?;
            let mut seen: Vec<&CellValue> = Vec::new();
            for cell in this.table.column_values(idx).filter(|c| !c.is_null()) {
                if !seen.iter().any(|s| s.compare(cell) == Ordering::Equal) {
                    seen.push(cell);
                }
            }
            lua.create_sequence_from(seen.into_iter().cloned())
        });

        methods.add_method("value_counts", |_, this, name: String| {
            let idx = this.col(&name)?;
            let mut counts: Vec<(CellValue, i64)> = Vec::new();
            for cell in this.table.column_values(idx).filter(|c| !c.is_null()) {
                match counts.iter_mut().find(|(v, _)| v.compare(cell) == Ordering::Equal) {
                    Some((_, n)) => *n += 1,
                    None => counts.push((cell.clone(), 1)),
                }
            }
            // Stable sort keeps encounter order among ties
            counts.sort_by(|a, b| b.1.cmp(&a.1));
            let rows = counts
                .into_iter()
                .map(|(v, n)| vec![v, CellValue::Int(n)])
                .collect();
            Ok(this.derive(Table::from_rows(vec![name, "count".to_string()], rows)))
        });

        methods.add_method("sum", |_, this, name: String| {
            let idx = this.col(&name)?;
            Ok(this.numbers(idx).sum::<f64>())
        });

        methods.add_method("mean", |_, this, name: String| {
            let idx = this.col(&name)?;
            let (total, count) = this.numbers(idx).fold((0.0, 0usize), |(t, c), x| (t + x, c + 1));
            Ok(if count == 0 { None } else { Some(total / count as f64) })
        });

        methods.add_method("min", |lua, this, name: String| {
            let idx = this.col(&name)?;
            this.extreme(idx, Ordering::Less).unwrap_or(CellValue::Null).into_lua(lua)
        });

        methods.add_method("max", |lua, this, name: String| {
            let idx = this.col(&name)?;
            this.extreme(idx, Ordering::Greater).unwrap_or(CellValue::Null).into_lua(lua)
        });

        methods.add_method(
            "group_by",
            |_, this, (key, value_col, agg): (String, Option<String>, Option<String>)| {
                let key_idx = this.col(&key)?;
                let agg = Aggregate::parse(agg.as_deref().unwrap_or("count"))?;
                let value_idx = match (&value_col, agg) {
                    (_, Aggregate::Count) => None,
                    (Some(name), _) => Some(this.col(name)?),
                    (None, _) => {
                        return Err(mlua::Error::RuntimeError(
                            "group_by needs a value column for sum/mean".to_string(),
                        ))
                    }
                };

                let mut order: Vec<CellValue> = Vec::new();
                let mut groups: HashMap<usize, (f64, usize)> = HashMap::new();
                for row in this.table.rows() {
                    let slot = match order.iter().position(|k| k.compare(&row[key_idx]) == Ordering::Equal) {
                        Some(i) => i,
                        None => {
                            order.push(row[key_idx].clone());
                            order.len() - 1
                        }
                    };
                    let entry = groups.entry(slot).or_insert((0.0, 0));
                    match value_idx {
                        Some(v) => {
                            if let Some(x) = row[v].as_f64() {
                                entry.0 += x;
                                entry.1 += 1;
                            }
                        }
                        None => entry.1 += 1,
                    }
                }

                let value_name = match agg {
                    Aggregate::Count => "count".to_string(),
                    _ => value_col.unwrap_or_default(),
                };
                let rows = order
                    .into_iter()
                    .enumerate()
                    .map(|(slot, k)| {
                        let (total, count) = groups.get(&slot).copied().unwrap_or((0.0, 0));
                        let v = match agg {
                            Aggregate::Count => CellValue::Int(count as i64),
                            Aggregate::Sum => CellValue::Float(total),
                            Aggregate::Mean if count == 0 => CellValue::Null,
                            Aggregate::Mean => CellValue::Float(total / count as f64),
                        };
                        vec![k, v]
                    })
                    .collect();
                Ok(this.derive(Table::from_rows(vec![key, value_name], rows)))
            },
        );

        methods.add_method("to_string", |_, this, ()| Ok(this.table.render_plain()));

        methods.add_method("to_markdown", |_, this, ()| {
            if this.markdown {
                Ok(this.table.render_markdown())
            } else {
                Err(mlua::Error::RuntimeError(MISSING_MARKDOWN.to_string()))
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sales() -> Table {
        let t = |s: &str| CellValue::Text(s.to_string());
        Table::from_rows(
            vec!["country".into(), "amount".into()],
            vec![
                vec![t("<COUN_1>"), CellValue::Int(10)],
                vec![t("<COUN_2>"), CellValue::Int(5)],
                vec![t("<COUN_1>"), CellValue::Float(2.5)],
                vec![CellValue::Null, CellValue::Int(1)],
            ],
        )
    }

    fn lua_with(frame: Frame) -> Lua {
        let lua = Lua::new();
        lua.globals().set("df", frame).unwrap();
        lua
    }

    fn eval<T: mlua::FromLua>(lua: &Lua, code: &str) -> T {
        lua.load(code).eval::<T>().unwrap()
    }

    #[test]
    fn test_shape_and_columns() {
        let lua = lua_with(Frame::new(sales(), false));
        assert_eq!(eval::<i64>(&lua, "return #df"), 4);
        assert_eq!(eval::<i64>(&lua, "return df:nrows()"), 4);
        assert_eq!(eval::<String>(&lua, "return table.concat(df:columns(), ',')"), "country,amount");
    }

    #[test]
    fn test_where_and_aggregates() {
        let lua = lua_with(Frame::new(sales(), false));
        assert_eq!(eval::<f64>(&lua, "return df:where('country', '<COUN_1>'):sum('amount')"), 12.5);
        assert_eq!(eval::<f64>(&lua, "return df:mean('amount')"), 4.625);
        assert_eq!(eval::<i64>(&lua, "return df:max('amount')"), 10);
        assert_eq!(eval::<i64>(&lua, "return df:min('amount')"), 1);
    }

    #[test]
    fn test_filter_and_sort() {
        let lua = lua_with(Frame::new(sales(), false));
        let n: i64 = eval(&lua, "return #df:filter(function(r) return r.amount > 3 end)");
        assert_eq!(n, 2);
        let top: i64 = eval(&lua, "return df:sort_by('amount', true):rows()[1].amount");
        assert_eq!(top, 10);
    }

    #[test]
    fn test_unique_and_value_counts() {
        let lua = lua_with(Frame::new(sales(), false));
        assert_eq!(eval::<i64>(&lua, "return #df:unique('country')"), 2);
        let vc: String = eval(&lua, "return df:value_counts('country'):to_string()");
        assert_eq!(vc, "country   count\n<COUN_1>  2\n<COUN_2>  1");
    }

    #[test]
    fn test_group_by() {
        let lua = lua_with(Frame::new(sales(), false));
        let out: String = eval(&lua, "return df:group_by('country', 'amount', 'sum'):to_string()");
        assert!(out.starts_with("country   amount"));
        assert!(out.contains("<COUN_1>  12.5"));
        let counts: i64 = eval(&lua, "return df:group_by('country'):rows()[1].count");
        assert_eq!(counts, 2);
    }

    #[test]
    fn test_select_and_head() {
        let lua = lua_with(Frame::new(sales(), false));
        let out: String = eval(&lua, "return df:select({'amount'}):head(2):to_string()");
        assert_eq!(out, "amount\n10\n5");
    }

    #[test]
    fn test_unknown_column_errors() {
        let lua = lua_with(Frame::new(sales(), false));
        let err = lua.load("return df:sum('nope')").exec().unwrap_err();
        assert!(err.to_string().contains("unknown column 'nope'"));
    }

    #[test]
    fn test_markdown_is_optional() {
        let lua = lua_with(Frame::new(sales(), false));
        let err = lua.load("return df:to_markdown()").exec().unwrap_err();
        assert!(err.to_string().contains("missing optional table formatter"));

        let lua = lua_with(Frame::new(sales(), true));
        let md: String = eval(&lua, "return df:head(1):to_markdown()");
        assert!(md.starts_with("| country | amount |"));
    }
}
