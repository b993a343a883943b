//! Core data models used throughout QuiKnow.
//!
//! These types carry a question through the retrieval pipeline: the tags
//! extracted from it, the leaves gathered for it, the structured-query
//! decision made over tabular leaves, and the final answer and report
//! records handed back to the caller.

use serde::{Serialize, Serializer};
use serde_json::Value;

/// Maximum number of retrieval tags kept per question.
pub const MAX_TAGS: usize = 12;
/// Maximum number of files the model may select from the overview.
pub const MAX_FILES: usize = 5;
/// Maximum number of structural nodes the model may select.
pub const MAX_NODES: usize = 6;
/// Number of selected files used as nodes when node selection yields nothing.
pub const NODE_FALLBACK_FILES: usize = 2;

/// Kind of node a gathered leaf originated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeType {
    /// Plain text content.
    Leaf,
    /// A CSV or spreadsheet source, eligible for structured querying.
    CsvExcel,
    /// Any other node type reported by the backend.
    Other(String),
}

impl NodeType {
    pub fn parse(s: &str) -> Self {
        match s {
            "" | "leaf" => NodeType::Leaf,
            "csv_excel" => NodeType::CsvExcel,
            other => NodeType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            NodeType::Leaf => "leaf",
            NodeType::CsvExcel => "csv_excel",
            NodeType::Other(s) => s,
        }
    }

    pub fn is_tabular(&self) -> bool {
        matches!(self, NodeType::CsvExcel)
    }
}

impl Serialize for NodeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A terminal content node returned by context gathering.
#[derive(Debug, Clone, Serialize)]
pub struct LeafContext {
    pub id: String,
    pub context: String,
    pub node_type: NodeType,
    pub hit: bool,
}

impl LeafContext {
    /// Render the leaf as it appears in the final context block.
    pub fn render(&self) -> String {
        if self.hit {
            format!("# Leaf {} [HIT]\n{}", self.id, self.context)
        } else {
            format!("# Leaf {}\n{}", self.id, self.context)
        }
    }
}

/// Outcome of the structured-query check for one question.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SqlDecision {
    /// A sanitized query was executed; `sql_result` is the executor's record
    /// (which may itself carry an error payload).
    Sql { sql: String, sql_result: Value },
    /// The model answered in natural language, or the query was refused.
    Nl { answer: String },
}

impl SqlDecision {
    pub fn nl(answer: impl Into<String>) -> Self {
        SqlDecision::Nl {
            answer: answer.into(),
        }
    }

    /// Render the decision as the `--- SQL ---` section of the context block.
    pub fn render(&self) -> String {
        match self {
            SqlDecision::Sql { sql, sql_result } => {
                let result = serde_json::to_string(sql_result).unwrap_or_default();
                format!(
                    "SQL executed: {}\nResult: {}",
                    sql,
                    truncate_chars(&result, 2000)
                )
            }
            SqlDecision::Nl { answer } => format!("Structured analysis: {}", answer),
        }
    }
}

/// Character and token totals for a group of text blocks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BlockStats {
    pub chars: usize,
    pub tokens: usize,
    pub blocks: usize,
}

/// Size metrics for one `ask` run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metrics {
    pub expanded_chars: usize,
    pub expanded_tokens: usize,
    pub leaf_stats: BlockStats,
    pub sql_chars: usize,
    pub sql_tokens: usize,
}

/// The last pipeline state an `ask` run reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Tagged,
    Overviewed,
    FilesSelected,
    StructureExpanded,
    NodesSelected,
    Gathered,
    SqlChecked,
    Answered,
}

/// Terminal artifact of one `ask` invocation.
///
/// Early terminations still produce a record: `stage` tells how far the
/// pipeline got and `final_context` carries whatever was accumulated.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerRecord {
    pub question: String,
    pub answer: String,
    pub final_context: Option<String>,
    pub tags: Vec<String>,
    pub chosen_files: Vec<String>,
    pub structure_nodes: Vec<String>,
    pub gathered_leaf_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<SqlDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    pub stage: Stage,
}

impl AnswerRecord {
    /// A record for a run that stopped before producing a model answer.
    pub fn degraded(question: &str, answer: &str, stage: Stage) -> Self {
        Self {
            question: question.to_string(),
            answer: answer.to_string(),
            final_context: None,
            tags: Vec::new(),
            chosen_files: Vec::new(),
            structure_nodes: Vec::new(),
            gathered_leaf_count: 0,
            sql: None,
            metrics: None,
            stage,
        }
    }
}

/// Per-sub-question summary kept in a [`ReportRecord`].
#[derive(Debug, Clone, Serialize)]
pub struct SubResult {
    pub question: String,
    pub answer: String,
    pub metrics: Option<Metrics>,
    pub chosen_files: Vec<String>,
    pub structure_nodes: Vec<String>,
}

impl From<AnswerRecord> for SubResult {
    fn from(record: AnswerRecord) -> Self {
        Self {
            question: record.question,
            answer: record.answer,
            metrics: record.metrics,
            chosen_files: record.chosen_files,
            structure_nodes: record.structure_nodes,
        }
    }
}

/// Terminal artifact of `ask_report`.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRecord {
    pub main_question: String,
    pub sub_questions: Vec<String>,
    pub sub_results: Vec<SubResult>,
    pub report: String,
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
