//! Structured-query analysis over tabular context.
//!
//! When a question touches CSV/spreadsheet content, [`SqlAnalyzer`] asks the
//! model whether a read-only query would help, then hardens whatever the
//! model wrote before running it:
//!
//! 1. placeholder `data` table → the single detected table ([`correct_table_name`])
//! 2. bare identifiers needing quotes → `"quoted"` ([`auto_quote`])
//! 3. SELECT-only, forbidden tokens, LIMIT ≤ 200, length ≤ 2000 ([`sanitize_sql`])
//! 4. execute; on `no such column: X` with one unambiguous candidate,
//!    rewrite and retry once ([`repair_missing_column`])
//!
//! Every refusal becomes a natural-language [`SqlDecision::Nl`]; nothing in
//! this module aborts the surrounding `ask` run.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row};

use crate::invoker::ToolInvoker;
use crate::model::{ChatMessage, ChatModel};
use crate::models::{truncate_chars, LeafContext, NodeType, SqlDecision};

/// Name of the backend tool that executes SQL.
pub const SQL_TOOL: &str = "sql_tool";

const DEFAULT_LIMIT: u64 = 200;
const MAX_SQL_CHARS: usize = 2000;
const MAX_TABULAR_CONTEXTS: usize = 2;
const MAX_SNIPPET_CHARS: usize = 800;

const PLACEHOLDER_ID: &str = "csv_fallback";
const PLACEHOLDER_CONTEXT: &str = "(no preview data; column names and sample rows may be needed)";

/// Question words that suggest tabular data even without a tabular leaf.
/// ASCII words must match whole words; CJK terms match anywhere.
static TABULAR_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:csv|excel|spreadsheets?|tables?|columns?|fields?|datasets?|data|statistic(?:s|al)?)\b",
    )
    .unwrap()
});

const TABULAR_CJK_TERMS: &[&str] = &["表", "字段", "列", "数据", "统计"];

const DECISION_PROMPT: &str = r#"You are a data analysis assistant. Decide whether a read-only SQL query is needed to answer the question.
If SQL would clearly improve accuracy, or the question needs aggregation, filtering or statistics, reply {"mode":"sql","sql":"SELECT ..."}.
Otherwise reply {"mode":"nl","answer":"direct answer"}.
Rules: 1) SELECT only; 2) always include LIMIT (<= 200); 3) never guess columns that do not exist; 4) if the columns shown are incomplete, answer in nl and say more context is needed; 5) use the table name given for each file; 6) wrap every column listed under quote_columns in double quotes.
Reply with exactly one JSON object on a single line, without code fences or any other text.
Example 1: {"mode":"sql","sql":"SELECT col1, COUNT(*) c FROM data LIMIT 50"}
Example 2: {"mode":"nl","answer":"The file only has columns A, B ..."}"#;

static SAFE_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

static SELECT_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^select\b").unwrap());

static FORBIDDEN_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(attach|pragma|drop|delete|update|insert|alter|create|replace|vacuum)\b")
        .unwrap()
});

static LIMIT_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\blimit\b").unwrap());

// Matched against the masked outer statement, starting at its last LIMIT.
static LIMIT_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^limit\s+(?P<first>.*?)(?:\s*,\s*(?P<count>.*?)|\s+offset\s+.*?)?\s*$")
        .unwrap()
});

static TABLE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:corresponding table|对应表|\btable)\s*[:：]\s*["'`]?([^\s"'`,;，]+)"#)
        .unwrap()
});

static DATA_TABLE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\b(from|join)(\s+)(?:"data"|data\b)"#).unwrap());

static NO_SUCH_COLUMN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)no such column:\s*([^\s,;]+)").unwrap());

// ═══════════════════════════════════════════════════════════════════════
// Sanitization
// ═══════════════════════════════════════════════════════════════════════

/// Why a generated query was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SqlRejection {
    #[error("only SELECT statements are allowed")]
    NotSelect,
    #[error("forbidden token: {0}")]
    ForbiddenToken(String),
    #[error("query is {0} characters, limit is 2000")]
    TooLong(usize),
    #[error("query uses placeholder table 'data' but several tables match: {}", .0.join(", "))]
    AmbiguousTable(Vec<String>),
}

/// Enforce the read-only query contract.
///
/// Strips surrounding semicolons, requires a leading `SELECT`, rejects
/// statement separators, comments and mutating keywords, and bounds the
/// result size: an outer statement without LIMIT gets `LIMIT 200`, and any
/// row count other than an integer of 200 or less is replaced by 200.
pub fn sanitize_sql(sql: &str) -> Result<String, SqlRejection> {
    let mut s = sql.trim().trim_matches(';').trim().to_string();

    if !SELECT_PREFIX.is_match(&s) {
        return Err(SqlRejection::NotSelect);
    }
    for token in [";", "--", "/*"] {
        if s.contains(token) {
            return Err(SqlRejection::ForbiddenToken(token.to_string()));
        }
    }
    if let Some(m) = FORBIDDEN_KEYWORD.find(&s) {
        return Err(SqlRejection::ForbiddenToken(m.as_str().to_uppercase()));
    }

    bound_limit(&mut s);

    let len = s.chars().count();
    if len > MAX_SQL_CHARS {
        return Err(SqlRejection::TooLong(len));
    }
    Ok(s)
}

/// Copy of `sql` with quoted text and parenthesized groups replaced by `#`,
/// byte for byte, so offsets into it are valid offsets into `sql`.
fn mask_outer_statement(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    for c in sql.chars() {
        let masked = match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                true
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    true
                }
                '[' => {
                    quote = Some(']');
                    true
                }
                '(' => {
                    depth += 1;
                    true
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    true
                }
                _ => depth > 0,
            },
        };
        if masked {
            out.push_str(&"#".repeat(c.len_utf8()));
        } else {
            out.push(c);
        }
    }
    out
}

/// Make the outer statement end in a row count of at most 200.
///
/// Only a LIMIT outside quotes and subqueries counts. Its row count
/// (`LIMIT n`, `LIMIT n OFFSET m`, `LIMIT m, n`) is replaced by 200 unless
/// it is a plain integer no larger than that.
fn bound_limit(s: &mut String) {
    let masked = mask_outer_statement(s);
    let Some(start) = LIMIT_WORD.find_iter(&masked).last().map(|m| m.start()) else {
        s.push_str(&format!(" LIMIT {}", DEFAULT_LIMIT));
        return;
    };
    let Some(caps) = LIMIT_CLAUSE.captures(&masked[start..]) else {
        s.push_str(&format!(" {}", DEFAULT_LIMIT));
        return;
    };
    let Some(count) = caps.name("count").or_else(|| caps.name("first")) else {
        return;
    };
    let range = start + count.start()..start + count.end();
    let within = s[range.clone()]
        .trim()
        .parse::<u64>()
        .map(|n| n <= DEFAULT_LIMIT)
        .unwrap_or(false);
    if !within {
        s.replace_range(range, &DEFAULT_LIMIT.to_string());
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Column metadata and rewriting
// ═══════════════════════════════════════════════════════════════════════

/// Columns of one table, split by whether they need quoting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableColumns {
    pub safe: Vec<String>,
    pub quote: Vec<String>,
}

/// Per-table column names from schema introspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMetadata {
    tables: BTreeMap<String, TableColumns>,
}

impl ColumnMetadata {
    /// Record a table's columns, classifying each name.
    pub fn insert<I, S>(&mut self, table: &str, columns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.tables.entry(table.to_string()).or_default();
        for name in columns {
            let name = name.into();
            if is_safe_identifier(&name) {
                entry.safe.push(name);
            } else {
                entry.quote.push(name);
            }
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableColumns> {
        self.tables.get(name)
    }

    fn quote_columns(&self) -> impl Iterator<Item = &String> {
        self.tables.values().flat_map(|t| t.quote.iter())
    }
}

pub fn is_safe_identifier(name: &str) -> bool {
    SAFE_IDENT.is_match(name)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Wrap bare occurrences of columns that need quoting in double quotes.
///
/// An occurrence is bare when it is not already quoted, not part of a longer
/// identifier, and not inside a single-quoted string literal.
pub fn auto_quote(sql: &str, metadata: &ColumnMetadata) -> String {
    let mut out = sql.to_string();
    for column in metadata.quote_columns() {
        out = quote_bare(&out, column);
    }
    out
}

fn quote_bare(sql: &str, column: &str) -> String {
    if column.is_empty() {
        return sql.to_string();
    }
    let mut out = String::with_capacity(sql.len() + 8);
    let mut last = 0;
    for (idx, _) in sql.match_indices(column) {
        if idx < last {
            continue;
        }
        let end = idx + column.len();
        let before = sql[..idx].chars().next_back();
        let after = sql[end..].chars().next();
        let in_literal = sql[..idx].matches('\'').count() % 2 == 1;
        let bare = !in_literal
            && !matches!(before, Some(c) if c == '"' || is_ident_char(c))
            && !matches!(after, Some(c) if c == '"' || is_ident_char(c));
        if bare {
            out.push_str(&sql[last..idx]);
            out.push_str(&quote_ident(column));
            last = end;
        }
    }
    out.push_str(&sql[last..]);
    out
}

/// Replace a placeholder `data` table with the real one.
///
/// No change when `data` is itself a detected table or no table was
/// detected. With several detected tables the query is refused so the model
/// can retry with an explicit name.
pub fn correct_table_name(sql: &str, tables: &[String]) -> Result<String, SqlRejection> {
    if tables.is_empty() || tables.iter().any(|t| t.eq_ignore_ascii_case("data")) {
        return Ok(sql.to_string());
    }
    if !DATA_TABLE_REF.is_match(sql) {
        return Ok(sql.to_string());
    }
    if tables.len() > 1 {
        return Err(SqlRejection::AmbiguousTable(tables.to_vec()));
    }
    let table = &tables[0];
    let replacement = if is_safe_identifier(table) {
        table.clone()
    } else {
        quote_ident(table)
    };
    Ok(DATA_TABLE_REF
        .replace_all(sql, |caps: &regex::Captures| {
            format!("{}{}{}", &caps[1], &caps[2], replacement)
        })
        .into_owned())
}

/// Rewrite a query after a `no such column: X` failure.
///
/// Returns `None` unless exactly one quoted-column candidate starts with `X`
/// and is longer than it. The candidate is matched in the query with
/// optional whitespace between its characters and replaced by its quoted
/// form; when no such span exists the query is returned unchanged so the
/// caller still makes its single retry.
pub fn repair_missing_column(sql: &str, error: &str, metadata: &ColumnMetadata) -> Option<String> {
    let fragment = NO_SUCH_COLUMN
        .captures(error)?
        .get(1)?
        .as_str()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`');
    if fragment.is_empty() {
        return None;
    }

    let mut candidates: Vec<&String> = metadata
        .quote_columns()
        .filter(|c| c.starts_with(fragment) && c.len() > fragment.len())
        .collect();
    candidates.sort();
    candidates.dedup();
    let [candidate] = candidates.as_slice() else {
        return None;
    };

    let pattern = candidate
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| regex::escape(&c.to_string()))
        .collect::<Vec<_>>()
        .join(r"\s*");
    let Ok(re) = Regex::new(&format!("(?i){}", pattern)) else {
        return Some(sql.to_string());
    };

    let quoted = quote_ident(candidate);
    let mut out = String::with_capacity(sql.len() + 2);
    let mut last = 0;
    for m in re.find_iter(sql) {
        let before = sql[..m.start()].chars().next_back();
        let after = sql[m.end()..].chars().next();
        if matches!(before, Some('"')) || matches!(after, Some('"')) {
            continue;
        }
        out.push_str(&sql[last..m.start()]);
        out.push_str(&quoted);
        last = m.end();
    }
    out.push_str(&sql[last..]);
    Some(out)
}

// ═══════════════════════════════════════════════════════════════════════
// Executors
// ═══════════════════════════════════════════════════════════════════════

/// Runs read-only SQL, returning `{status: "success", rows}` or
/// `{status: "error", message}`. Never fails.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Value;
}

/// Forwards queries to the backend `sql_tool`.
pub struct ToolSqlExecutor {
    invoker: Arc<ToolInvoker>,
}

impl ToolSqlExecutor {
    pub fn new(invoker: Arc<ToolInvoker>) -> Self {
        Self { invoker }
    }
}

#[async_trait]
impl SqlExecutor for ToolSqlExecutor {
    async fn execute(&self, sql: &str) -> Value {
        self.invoker
            .call(SQL_TOOL, json!({ "sql": sql }))
            .await
            .into_value()
    }
}

/// Executes queries against a local SQLite file opened read-only.
///
/// Each query is bounded by `timeout` and returns at most 200 rows.
pub struct SqliteExecutor {
    pool: SqlitePool,
    timeout: Duration,
}

impl SqliteExecutor {
    pub async fn open(path: &Path, timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;

        Ok(Self { pool, timeout })
    }
}

fn row_to_json(row: &SqliteRow) -> Value {
    let mut obj = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        obj.insert(column.name().to_string(), value);
    }
    Value::Object(obj)
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    async fn execute(&self, sql: &str) -> Value {
        let rows = sqlx::query(sql)
            .fetch(&self.pool)
            .take(DEFAULT_LIMIT as usize)
            .try_collect::<Vec<SqliteRow>>();
        match tokio::time::timeout(self.timeout, rows).await {
            Ok(Ok(rows)) => json!({
                "status": "success",
                "rows": rows.iter().map(row_to_json).collect::<Vec<_>>(),
            }),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "sqlite query failed");
                json!({ "status": "error", "message": e.to_string() })
            }
            Err(_) => {
                let message = format!(
                    "query timed out after {:.1}s",
                    self.timeout.as_secs_f64()
                );
                tracing::warn!(error = %message, "sqlite query failed");
                json!({ "status": "error", "message": message })
            }
        }
    }
}

fn execution_error(result: &Value) -> Option<&str> {
    if result.get("status").and_then(|s| s.as_str()) == Some("success") {
        return None;
    }
    result
        .get("message")
        .or_else(|| result.get("error"))
        .and_then(|m| m.as_str())
}

fn result_rows(result: &Value) -> &[Value] {
    result
        .get("rows")
        .or_else(|| result.get("result"))
        .and_then(|r| r.as_array())
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

// ═══════════════════════════════════════════════════════════════════════
// Analyzer
// ═══════════════════════════════════════════════════════════════════════

/// The model's reply to the decision prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelDecision {
    Sql(String),
    Nl(String),
}

#[derive(Deserialize)]
struct DecisionReply {
    #[serde(default)]
    mode: String,
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    answer: Option<String>,
}

/// Parse a decision reply. The trimmed reply must be one JSON object.
pub fn parse_decision(reply: &str) -> Option<ModelDecision> {
    let value: Value = serde_json::from_str(reply.trim()).ok()?;
    if !value.is_object() {
        return None;
    }
    let parsed: DecisionReply = serde_json::from_value(value).ok()?;
    if parsed.mode.eq_ignore_ascii_case("sql") {
        Some(ModelDecision::Sql(parsed.sql.unwrap_or_default()))
    } else {
        Some(ModelDecision::Nl(parsed.answer.unwrap_or_default()))
    }
}

/// Schema snippet recovered from one tabular leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabularSnippet {
    pub id: String,
    pub table: Option<String>,
    pub schema: String,
    pub sample: String,
}

/// Split a leaf's text on its `SCHEMA:`/`SAMPLE:` markers and find its table.
pub fn parse_tabular_context(leaf: &LeafContext) -> TabularSnippet {
    let text = &leaf.context;
    let (schema, sample) = match text.split_once("SCHEMA:") {
        Some((_, rest)) => match rest.split_once("SAMPLE:") {
            Some((schema, sample)) => (schema, sample),
            None => (rest, ""),
        },
        None => ("", ""),
    };
    TabularSnippet {
        id: leaf.id.clone(),
        table: detect_table_name(text),
        schema: snippet(schema),
        sample: snippet(sample),
    }
}

fn snippet(part: &str) -> String {
    truncate_chars(strip_table_marker(part).trim(), MAX_SNIPPET_CHARS).to_string()
}

fn strip_table_marker(text: &str) -> &str {
    match TABLE_MARKER.find(text) {
        Some(m) if text[m.end()..].trim().is_empty() => &text[..m.start()],
        _ => text,
    }
}

/// Find an explicit `TABLE:` (or "corresponding table:") marker.
pub fn detect_table_name(text: &str) -> Option<String> {
    TABLE_MARKER
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn mentions_tabular_data(question: &str) -> bool {
    TABULAR_WORDS.is_match(question) || TABULAR_CJK_TERMS.iter().any(|t| question.contains(t))
}

/// Decides whether a question needs a structured query and runs it.
pub struct SqlAnalyzer {
    model: Option<Arc<dyn ChatModel>>,
    executor: Option<Arc<dyn SqlExecutor>>,
}

impl SqlAnalyzer {
    pub fn new(model: Option<Arc<dyn ChatModel>>, executor: Option<Arc<dyn SqlExecutor>>) -> Self {
        Self { model, executor }
    }

    /// Returns `None` when there is no model or no tabular signal, or the
    /// model's reply cannot be parsed.
    pub async fn analyze(&self, contexts: &[LeafContext], question: &str) -> Option<SqlDecision> {
        let model = self.model.as_ref()?;

        let mut tabular: Vec<LeafContext> = contexts
            .iter()
            .filter(|c| c.node_type.is_tabular())
            .cloned()
            .collect();
        tracing::debug!(tabular = tabular.len(), "sql check");
        if tabular.is_empty() {
            if !mentions_tabular_data(question) {
                return None;
            }
            tabular.push(LeafContext {
                id: PLACEHOLDER_ID.to_string(),
                context: PLACEHOLDER_CONTEXT.to_string(),
                node_type: NodeType::CsvExcel,
                hit: false,
            });
        }

        let snippets: Vec<TabularSnippet> = tabular
            .iter()
            .take(MAX_TABULAR_CONTEXTS)
            .map(parse_tabular_context)
            .collect();
        let mut tables: Vec<String> = Vec::new();
        for table in snippets.iter().filter_map(|s| s.table.clone()) {
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
        let metadata = self.introspect(&tables).await;

        let files: Vec<Value> = snippets
            .iter()
            .map(|s| {
                let quote_columns = s
                    .table
                    .as_deref()
                    .and_then(|t| metadata.table(t))
                    .map(|c| c.quote.clone())
                    .unwrap_or_default();
                json!({
                    "id": s.id,
                    "table": s.table,
                    "schema": s.schema,
                    "sample": s.sample,
                    "quote_columns": quote_columns,
                })
            })
            .collect();
        let user_block = json!({ "question": question, "files": files });

        let messages = [
            ChatMessage::system(DECISION_PROMPT),
            ChatMessage::human(user_block.to_string()),
        ];
        let reply = match model.invoke(&messages).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "sql decision call failed");
                return None;
            }
        };
        let decision = match parse_decision(&reply) {
            Some(d) => d,
            None => {
                tracing::warn!(reply = %truncate_chars(&reply, 200), "unparsable sql decision");
                return None;
            }
        };
        tracing::debug!(?decision, "sql decision");

        let raw_sql = match decision {
            ModelDecision::Nl(answer) => return Some(SqlDecision::nl(answer)),
            ModelDecision::Sql(sql) => sql,
        };

        let sql = match self.harden(&raw_sql, &tables, &metadata) {
            Ok(sql) => sql,
            Err(SqlRejection::AmbiguousTable(candidates)) => {
                tracing::warn!(sql = %raw_sql, "placeholder table with several candidates");
                return Some(SqlDecision::nl(format!(
                    "(the query used the placeholder table 'data'; retry with one of: {})",
                    candidates.join(", ")
                )));
            }
            Err(e) => {
                tracing::warn!(error = %e, sql = %raw_sql, "sql rejected");
                return Some(SqlDecision::nl(
                    "(the generated SQL was unsafe or invalid; answering in natural language)",
                ));
            }
        };

        let Some(executor) = &self.executor else {
            return Some(SqlDecision::nl("(no SQL execution capability configured)"));
        };

        tracing::info!(sql = %sql, "executing sql");
        let mut final_sql = sql;
        let mut result = executor.execute(&final_sql).await;

        let repaired = execution_error(&result)
            .and_then(|err| repair_missing_column(&final_sql, err, &metadata));
        if let Some(repaired) = repaired {
            tracing::info!(sql = %repaired, "retrying sql after column repair");
            result = executor.execute(&repaired).await;
            final_sql = repaired;
        }

        Some(SqlDecision::Sql {
            sql: final_sql,
            sql_result: result,
        })
    }

    fn harden(
        &self,
        raw_sql: &str,
        tables: &[String],
        metadata: &ColumnMetadata,
    ) -> Result<String, SqlRejection> {
        let corrected = correct_table_name(raw_sql, tables)?;
        sanitize_sql(&auto_quote(&corrected, metadata))
    }

    async fn introspect(&self, tables: &[String]) -> ColumnMetadata {
        let mut metadata = ColumnMetadata::default();
        let Some(executor) = &self.executor else {
            return metadata;
        };
        for table in tables {
            let result = executor
                .execute(&format!("PRAGMA table_info({})", quote_ident(table)))
                .await;
            if let Some(err) = execution_error(&result) {
                tracing::warn!(table = %table, error = %err, "schema introspection failed");
                continue;
            }
            let names: Vec<String> = result_rows(&result)
                .iter()
                .filter_map(|row| row.get("name").and_then(|n| n.as_str()))
                .map(str::to_string)
                .collect();
            metadata.insert(table, names);
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn metadata() -> ColumnMetadata {
        let mut m = ColumnMetadata::default();
        m.insert("t", ["R&D_Spend", "Name"]);
        m
    }

    #[test]
    fn test_sanitize_appends_limit() {
        let s = sanitize_sql("select * from t").unwrap();
        assert_eq!(s, "select * from t LIMIT 200");
    }

    #[test]
    fn test_sanitize_strips_trailing_semicolon() {
        assert_eq!(
            sanitize_sql("SELECT a FROM t LIMIT 5;").unwrap(),
            "SELECT a FROM t LIMIT 5"
        );
    }

    #[test]
    fn test_sanitize_rejects_non_select() {
        assert_eq!(sanitize_sql("DROP TABLE t"), Err(SqlRejection::NotSelect));
        assert_eq!(sanitize_sql(""), Err(SqlRejection::NotSelect));
        assert_eq!(
            sanitize_sql("selective FROM t"),
            Err(SqlRejection::NotSelect)
        );
    }

    #[test]
    fn test_sanitize_rejects_stacked_statements_and_comments() {
        assert!(matches!(
            sanitize_sql("select 1; drop table t"),
            Err(SqlRejection::ForbiddenToken(_))
        ));
        assert!(sanitize_sql("select 1 -- hi").is_err());
        assert!(sanitize_sql("select /* x */ 1").is_err());
    }

    #[test]
    fn test_sanitize_rejects_keywords_as_whole_words_only() {
        assert_eq!(
            sanitize_sql("SELECT * FROM t WHERE x IN (SELECT 1) UNION SELECT pragma FROM t"),
            Err(SqlRejection::ForbiddenToken("PRAGMA".to_string()))
        );
        assert!(sanitize_sql("SELECT created_at, updated_by FROM t").is_ok());
    }

    #[test]
    fn test_sanitize_rejects_long_queries() {
        let sql = format!("SELECT {} FROM t", "a, ".repeat(700));
        assert!(matches!(sanitize_sql(&sql), Err(SqlRejection::TooLong(_))));
    }

    #[test]
    fn test_sanitize_keeps_existing_small_limit() {
        let sql = "SELECT Category, SUM(Revenue_USD) FROM sales GROUP BY Category LIMIT 50";
        assert_eq!(sanitize_sql(sql).unwrap(), sql);
    }

    #[test]
    fn test_sanitize_clamps_large_limit() {
        assert_eq!(
            sanitize_sql("SELECT a FROM t limit 5000").unwrap(),
            "SELECT a FROM t limit 200"
        );
    }

    #[test]
    fn test_sanitize_bounds_negative_limit() {
        assert_eq!(
            sanitize_sql("SELECT * FROM t LIMIT -1").unwrap(),
            "SELECT * FROM t LIMIT 200"
        );
        assert_eq!(
            sanitize_sql("SELECT * FROM t LIMIT (SELECT 9999)").unwrap(),
            "SELECT * FROM t LIMIT 200"
        );
    }

    #[test]
    fn test_sanitize_bounds_offset_forms() {
        assert_eq!(
            sanitize_sql("SELECT * FROM t LIMIT 5, 100000").unwrap(),
            "SELECT * FROM t LIMIT 5, 200"
        );
        assert_eq!(
            sanitize_sql("SELECT * FROM t LIMIT 500 OFFSET 10").unwrap(),
            "SELECT * FROM t LIMIT 200 OFFSET 10"
        );
        let kept = "SELECT * FROM t LIMIT 10 OFFSET 500";
        assert_eq!(sanitize_sql(kept).unwrap(), kept);
    }

    #[test]
    fn test_sanitize_ignores_limit_in_subquery_and_literals() {
        assert_eq!(
            sanitize_sql("SELECT * FROM t WHERE a IN (SELECT a FROM u LIMIT 5)").unwrap(),
            "SELECT * FROM t WHERE a IN (SELECT a FROM u LIMIT 5) LIMIT 200"
        );
        assert_eq!(
            sanitize_sql("SELECT * FROM t WHERE note = 'no limit'").unwrap(),
            "SELECT * FROM t WHERE note = 'no limit' LIMIT 200"
        );
        assert_eq!(
            sanitize_sql(r#"SELECT "limit" FROM t"#).unwrap(),
            r#"SELECT "limit" FROM t LIMIT 200"#
        );
    }

    #[test]
    fn test_tabular_keywords_match_whole_words() {
        assert!(mentions_tabular_data("which column holds totals"));
        assert!(mentions_tabular_data("Statistics for Q3"));
        assert!(mentions_tabular_data("按地区统计销售额"));
        assert!(!mentions_tabular_data("how do I update the metadata"));
        assert!(!mentions_tabular_data("is the vegetable supply stable"));
    }

    #[test]
    fn test_auto_quote_wraps_bare_columns() {
        let sql = r#"SELECT Name, R&D_Spend FROM t WHERE "R&D_Spend" > 0 AND note = 'R&D_Spend'"#;
        assert_eq!(
            auto_quote(sql, &metadata()),
            r#"SELECT Name, "R&D_Spend" FROM t WHERE "R&D_Spend" > 0 AND note = 'R&D_Spend'"#
        );
    }

    #[test]
    fn test_auto_quote_ignores_longer_identifiers() {
        let mut m = ColumnMetadata::default();
        m.insert("t", ["2023"]);
        assert_eq!(
            auto_quote("SELECT 2023, x2023 FROM t", &m),
            r#"SELECT "2023", x2023 FROM t"#
        );
    }

    #[test]
    fn test_column_classification() {
        let m = metadata();
        let cols = m.table("t").unwrap();
        assert_eq!(cols.safe, vec!["Name"]);
        assert_eq!(cols.quote, vec!["R&D_Spend"]);
        assert!(!is_safe_identifier("1st"));
        assert!(is_safe_identifier("_private1"));
    }

    #[test]
    fn test_correct_single_table() {
        let tables = vec!["sales".to_string()];
        assert_eq!(
            correct_table_name("SELECT a FROM data LIMIT 5", &tables).unwrap(),
            "SELECT a FROM sales LIMIT 5"
        );
        assert_eq!(
            correct_table_name("SELECT a FROM \"data\" JOIN data ON 1", &tables).unwrap(),
            "SELECT a FROM sales JOIN sales ON 1"
        );
        assert_eq!(
            correct_table_name("SELECT data_id FROM datasets", &tables).unwrap(),
            "SELECT data_id FROM datasets"
        );
    }

    #[test]
    fn test_correct_multiple_tables_rejected() {
        let tables = vec!["sales".to_string(), "costs".to_string()];
        assert_eq!(
            correct_table_name("SELECT a FROM data", &tables),
            Err(SqlRejection::AmbiguousTable(tables.clone()))
        );
        assert!(correct_table_name("SELECT a FROM sales", &tables).is_ok());
    }

    #[test]
    fn test_correct_without_tables_is_noop() {
        assert_eq!(
            correct_table_name("SELECT a FROM data", &[]).unwrap(),
            "SELECT a FROM data"
        );
    }

    #[test]
    fn test_repair_single_candidate() {
        let repaired = repair_missing_column(
            "SELECT R & D_Spend FROM t LIMIT 200",
            "error returned from database: (code: 1) no such column: R",
            &metadata(),
        );
        assert_eq!(
            repaired.as_deref(),
            Some(r#"SELECT "R&D_Spend" FROM t LIMIT 200"#)
        );
    }

    #[test]
    fn test_repair_requires_unique_candidate() {
        let mut m = metadata();
        m.insert("u", ["R&D_Budget"]);
        assert!(repair_missing_column("SELECT R FROM t", "no such column: R", &m).is_none());
        assert!(repair_missing_column("SELECT R FROM t", "syntax error", &metadata()).is_none());
        assert!(
            repair_missing_column("SELECT Zed FROM t", "no such column: Zed", &metadata())
                .is_none()
        );
    }

    #[test]
    fn test_parse_decision_strict() {
        assert_eq!(
            parse_decision(r#" {"mode":"sql","sql":"SELECT 1"} "#),
            Some(ModelDecision::Sql("SELECT 1".to_string()))
        );
        assert_eq!(
            parse_decision(r#"{"mode":"NL","answer":"two columns"}"#),
            Some(ModelDecision::Nl("two columns".to_string()))
        );
        assert!(parse_decision("Sure! {\"mode\":\"sql\",\"sql\":\"SELECT 1\"}").is_none());
        assert!(parse_decision("```json\n{\"mode\":\"nl\"}\n```").is_none());
        assert!(parse_decision("[1,2]").is_none());
    }

    #[test]
    fn test_parse_tabular_context() {
        let leaf = LeafContext {
            id: "7".to_string(),
            context: "SCHEMA: Category, Revenue_USD SAMPLE: Toys, 1200\nTABLE: sales".to_string(),
            node_type: NodeType::CsvExcel,
            hit: true,
        };
        let snippet = parse_tabular_context(&leaf);
        assert_eq!(snippet.table.as_deref(), Some("sales"));
        assert_eq!(snippet.schema, "Category, Revenue_USD");
        assert_eq!(snippet.sample, "Toys, 1200");
    }

    #[test]
    fn test_table_marker_stripped_from_snippets() {
        let leaf = LeafContext {
            id: "8".to_string(),
            context: "SCHEMA: Region, Units TABLE: stock SAMPLE: North, 4".to_string(),
            node_type: NodeType::CsvExcel,
            hit: false,
        };
        let snippet = parse_tabular_context(&leaf);
        assert_eq!(snippet.table.as_deref(), Some("stock"));
        assert_eq!(snippet.schema, "Region, Units");
        assert_eq!(snippet.sample, "North, 4");
    }

    #[test]
    fn test_detect_localized_table_marker() {
        assert_eq!(
            detect_table_name("预览\n对应表：finance_2023"),
            Some("finance_2023".to_string())
        );
        assert_eq!(detect_table_name("no marker here"), None);
    }

    // ── analyzer ────────────────────────────────────────────────────────

    struct Reply(String);

    #[async_trait]
    impl ChatModel for Reply {
        fn model_name(&self) -> &str {
            "mock"
        }

        async fn invoke(&self, _messages: &[ChatMessage]) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    /// Answers PRAGMA with fixed columns and replays scripted query results.
    struct ScriptedExecutor {
        columns: Vec<&'static str>,
        results: Mutex<Vec<Value>>,
        queries: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn new(columns: Vec<&'static str>, results: Vec<Value>) -> Self {
            Self {
                columns,
                results: Mutex::new(results),
                queries: Mutex::new(Vec::new()),
            }
        }

        fn queries(&self) -> Vec<String> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SqlExecutor for ScriptedExecutor {
        async fn execute(&self, sql: &str) -> Value {
            if sql.starts_with("PRAGMA") {
                let rows: Vec<Value> = self.columns.iter().map(|c| json!({ "name": c })).collect();
                return json!({ "status": "success", "rows": rows });
            }
            self.queries.lock().unwrap().push(sql.to_string());
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                json!({ "status": "success", "rows": [] })
            } else {
                results.remove(0)
            }
        }
    }

    fn tabular_leaf(table: &str) -> LeafContext {
        LeafContext {
            id: "n1".to_string(),
            context: format!("SCHEMA: Name, R&D_Spend SAMPLE: Acme, 10\nTABLE: {}", table),
            node_type: NodeType::CsvExcel,
            hit: true,
        }
    }

    fn analyzer(reply: &str, executor: Option<Arc<dyn SqlExecutor>>) -> SqlAnalyzer {
        SqlAnalyzer::new(Some(Arc::new(Reply(reply.to_string()))), executor)
    }

    #[tokio::test]
    async fn test_no_model_means_no_decision() {
        let a = SqlAnalyzer::new(None, None);
        assert!(a.analyze(&[tabular_leaf("t")], "how many rows").await.is_none());
    }

    #[tokio::test]
    async fn test_no_tabular_signal_means_no_decision() {
        let a = analyzer(r#"{"mode":"nl","answer":"x"}"#, None);
        let leaf = LeafContext {
            id: "1".to_string(),
            context: "prose".to_string(),
            node_type: NodeType::Leaf,
            hit: false,
        };
        assert!(a.analyze(&[leaf], "who founded the company").await.is_none());
    }

    #[tokio::test]
    async fn test_keyword_triggers_placeholder_decision() {
        let a = analyzer(r#"{"mode":"nl","answer":"need the column list"}"#, None);
        let decision = a.analyze(&[], "which column holds totals").await;
        assert_eq!(decision, Some(SqlDecision::nl("need the column list")));
    }

    #[tokio::test]
    async fn test_missing_executor_falls_back() {
        let a = analyzer(r#"{"mode":"sql","sql":"SELECT Name FROM data"}"#, None);
        let decision = a.analyze(&[tabular_leaf("t")], "list names").await;
        assert_eq!(
            decision,
            Some(SqlDecision::nl("(no SQL execution capability configured)"))
        );
    }

    #[tokio::test]
    async fn test_unsafe_sql_falls_back() {
        let exec = Arc::new(ScriptedExecutor::new(vec!["Name"], vec![]));
        let a = analyzer(r#"{"mode":"sql","sql":"DELETE FROM t"}"#, Some(exec.clone()));
        let decision = a.analyze(&[tabular_leaf("t")], "remove rows").await;
        assert!(matches!(decision, Some(SqlDecision::Nl { .. })));
        assert!(exec.queries().is_empty());
    }

    #[tokio::test]
    async fn test_executes_quoted_corrected_query() {
        let exec = Arc::new(ScriptedExecutor::new(
            vec!["Name", "R&D_Spend"],
            vec![json!({ "status": "success", "rows": [{ "Name": "Acme" }] })],
        ));
        let a = analyzer(
            r#"{"mode":"sql","sql":"SELECT Name, R&D_Spend FROM data"}"#,
            Some(exec.clone()),
        );
        let decision = a.analyze(&[tabular_leaf("t")], "spend by company").await;
        let expected = r#"SELECT Name, "R&D_Spend" FROM t LIMIT 200"#;
        assert_eq!(exec.queries(), vec![expected.to_string()]);
        match decision {
            Some(SqlDecision::Sql { sql, sql_result }) => {
                assert_eq!(sql, expected);
                assert_eq!(sql_result["rows"][0]["Name"], "Acme");
            }
            other => panic!("expected sql decision, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_repair_retries_exactly_once() {
        let failure = json!({ "status": "error", "message": "no such column: R" });
        let exec = Arc::new(ScriptedExecutor::new(
            vec!["Name", "R&D_Spend"],
            vec![failure.clone(), failure.clone(), failure.clone()],
        ));
        let a = analyzer(
            r#"{"mode":"sql","sql":"SELECT R & D_Spend FROM t LIMIT 10"}"#,
            Some(exec.clone()),
        );
        let decision = a.analyze(&[tabular_leaf("t")], "total spend").await;
        let queries = exec.queries();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[1], r#"SELECT "R&D_Spend" FROM t LIMIT 10"#);
        match decision {
            Some(SqlDecision::Sql { sql_result, .. }) => assert_eq!(sql_result, failure),
            other => panic!("expected sql decision, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ambiguous_table_requests_retry() {
        let exec = Arc::new(ScriptedExecutor::new(vec!["Name"], vec![]));
        let a = analyzer(r#"{"mode":"sql","sql":"SELECT Name FROM data"}"#, Some(exec.clone()));
        let mut second = tabular_leaf("costs");
        second.id = "n2".to_string();
        let decision = a
            .analyze(&[tabular_leaf("sales"), second], "compare names")
            .await;
        match decision {
            Some(SqlDecision::Nl { answer }) => {
                assert!(answer.contains("sales"));
                assert!(answer.contains("costs"));
            }
            other => panic!("expected nl decision, got {:?}", other),
        }
        assert!(exec.queries().is_empty());
    }

    #[tokio::test]
    async fn test_unparsable_reply_yields_none() {
        let a = analyzer("I think you should run SELECT *", None);
        assert!(a.analyze(&[tabular_leaf("t")], "rows").await.is_none());
    }
}
