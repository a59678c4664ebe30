//! Prompt templates for the analysis pipeline

use crate::dataset::Table;

/// Build the code-synthesis prompt from schema, a row sample and the masked query
pub fn analysis_prompt(table: &Table, query: &str, sample_rows: usize, markdown_tables: bool) -> String {
    let table_rule = if markdown_tables {
        "Render tabular answers with `df:to_string()`, or `df:to_markdown()` for a markdown table."
    } else {
        "Render tabular answers with `df:to_string()`."
    };

    format!(
        r#"Role: Lua data analyst.
Task: Write Lua 5.4 code that answers the query using the pre-bound frame `df`.

SCHEMA:
{schema}
SAMPLE DATA:
{sample}

QUERY: "{query}"

FRAME API:
df:columns(), df:nrows() or #df, df:rows(), df:column(name), df:head(n),
df:filter(function(row) ... end), df:where(col, value), df:select({{cols}}),
df:sort_by(col, descending), df:unique(col), df:value_counts(col),
df:sum(col), df:mean(col), df:min(col), df:max(col),
df:group_by(key, value_col, "sum"|"mean"|"count"), df:to_string()

RULES:
1. `df` is already loaded. Do not read files; `os`, `io` and `require` are unavailable.
2. Store the final answer in the global `result`.
3. Optionally store chart data in the global `chart_data` as {{labels = {{...}}, values = {{...}}}}. No plotting.
4. NO TRUNCATION: when asked to show or list items, return every item, e.g. `result = table.concat(df:unique(col), "\n")`.
5. {table_rule}
6. Values like <KIND_1> are placeholders; use them exactly as written.
7. RETURN ONLY LUA CODE in a ```lua block."#,
        schema = table.schema_summary(),
        sample = table.head(sample_rows).render_plain(),
        query = query,
        table_rule = table_rule,
    )
}

/// Ask the model to present a computed result without changing its data
pub fn polish_prompt(query: &str, raw_result: &str) -> String {
    format!(
        r#"Present this computed result as a clear answer to the question.
Keep every value, placeholder (such as <KIND_1>) and table row exactly as given.
Keep tables and lists in their current formatting. Do not add data.

QUESTION: "{query}"

RESULT:
{raw_result}"#
    )
}

/// Single-call prompt for unstructured documents
pub fn document_prompt(query: &str, document: &str, max_chars: usize) -> String {
    let prefix: String = document.chars().take(max_chars).collect();
    format!("Analyze this text: {query}\n\nContext:\n{prefix}")
}

/// Prompt for queries without an uploaded dataset
pub fn conversation_prompt(query: &str) -> String {
    format!("User Query: {query}")
}
