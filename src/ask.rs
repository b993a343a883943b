//! The staged `ask` pipeline.
//!
//! One question moves through these states, each of which may end the run
//! early with a degraded [`AnswerRecord`]:
//!
//! ```text
//! Tagged → Overviewed → FilesSelected → StructureExpanded
//!        → NodesSelected → Gathered → SqlChecked → Answered
//! ```
//!
//! | Stage | Backend / model call | On failure |
//! |-------|----------------------|------------|
//! | Tagged | [`TagExtractor`] | heuristic tags |
//! | Overviewed | `search_documents` overview | stop: "directory retrieval failed" |
//! | FilesSelected | model picks ≤ 5 ids | stop: "no relevant file selected" |
//! | StructureExpanded | `search_documents` expand | stop: "file expansion failed" |
//! | NodesSelected | model picks ≤ 6 nodes | first 2 file ids |
//! | Gathered | `gather_context` | no leaves, continue |
//! | SqlChecked | [`SqlAnalyzer`] | no SQL block, continue |
//! | Answered | model answers from context | error text as the answer |

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::Instrument;
use uuid::Uuid;

use crate::backend::BackendClient;
use crate::board;
use crate::invoker::ToolInvoker;
use crate::model::{ChatMessage, ChatModel, MODEL_UNAVAILABLE};
use crate::models::{
    AnswerRecord, LeafContext, Metrics, SqlDecision, Stage, MAX_FILES, MAX_NODES,
    NODE_FALLBACK_FILES,
};
use crate::sql::{SqlAnalyzer, SqlExecutor, ToolSqlExecutor};
use crate::tags::TagExtractor;
use crate::tokens::TokenEstimator;

pub const EMPTY_QUESTION: &str = "empty question";
pub const DIRECTORY_RETRIEVAL_FAILED: &str = "directory retrieval failed";
pub const NO_FILE_SELECTED: &str = "no relevant file selected";
pub const FILE_EXPANSION_FAILED: &str = "file expansion failed";

const FILE_SELECTION_PROMPT: &str = "This is the knowledge-base directory tree, annotated with #id \
and [HIT] markers. Output only the 1-5 most relevant file ids, comma-separated.";

const NODE_SELECTION_PROMPT: &str = "Below is the internal structure of the target files (content \
leaves are hidden; CSV/Excel files carry an extra preview node).\n\
Task: choose the 1-6 most relevant, smallest structural node ids.\n\
Rule: if the question concerns the content or statistics of a data file (.csv/.xls/.xlsx), you \
must include that file's top-level (type=0) node id, not only its preview sub-node.\n\
Output format: NODES: id1,id2,... Output only this line.";

const ANSWER_PROMPT: &str = "Answer the question from the context. If you are unsure, say so \
explicitly. Do not fabricate.";

static ID_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#id:?\s*").unwrap());

static NODES_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)NODES?:\s*(.+)").unwrap());

/// Parse a comma-separated file selection, dropping `#id` prefixes.
pub fn parse_file_ids(reply: &str) -> Vec<String> {
    reply
        .trim()
        .split(',')
        .map(|raw| ID_PREFIX.replace_all(raw.trim(), "").trim().to_string())
        .filter(|id| !id.is_empty())
        .take(MAX_FILES)
        .collect()
}

/// Parse the first `NODES:` line of a node selection.
pub fn parse_node_ids(reply: &str) -> Vec<String> {
    let Some(caps) = reply.lines().find_map(|line| NODES_LINE.captures(line)) else {
        return Vec::new();
    };
    caps[1]
        .split(',')
        .map(|raw| ID_PREFIX.replace_all(raw.trim(), "").trim().to_string())
        .filter(|id| !id.is_empty())
        .take(MAX_NODES)
        .collect()
}

/// Assemble the context block handed to the answering call.
pub fn build_context_block(structure: &str, leaves: &[LeafContext], sql_text: &str) -> String {
    let mut block = structure.to_string();
    if !leaves.is_empty() {
        block.push_str("\n\n--- LEAVES ---\n");
        block.push_str(
            &leaves
                .iter()
                .map(LeafContext::render)
                .collect::<Vec<_>>()
                .join("\n\n"),
        );
    }
    if !sql_text.is_empty() {
        block.push_str("\n\n--- SQL ---\n");
        block.push_str(sql_text);
    }
    block
}

/// Drives one question through the staged retrieval pipeline.
pub struct RetrievalOrchestrator {
    backend: BackendClient,
    model: Option<Arc<dyn ChatModel>>,
    tagger: TagExtractor,
    sql: SqlAnalyzer,
    tokens: Arc<TokenEstimator>,
    board_path: Option<PathBuf>,
}

impl RetrievalOrchestrator {
    /// SQL goes to the backend `sql_tool` unless replaced with
    /// [`with_sql_executor`](Self::with_sql_executor).
    pub fn new(
        invoker: Arc<ToolInvoker>,
        model: Option<Arc<dyn ChatModel>>,
        tokens: Arc<TokenEstimator>,
    ) -> Self {
        let executor: Arc<dyn SqlExecutor> = Arc::new(ToolSqlExecutor::new(invoker.clone()));
        Self {
            backend: BackendClient::new(invoker),
            tagger: TagExtractor::new(model.clone()),
            sql: SqlAnalyzer::new(model.clone(), Some(executor)),
            model,
            tokens,
            board_path: None,
        }
    }

    /// Replace the SQL executor; `None` disables query execution.
    pub fn with_sql_executor(mut self, executor: Option<Arc<dyn SqlExecutor>>) -> Self {
        self.sql = SqlAnalyzer::new(self.model.clone(), executor);
        self
    }

    /// Overwrite this file with the question and answer after each run.
    pub fn with_board_path(mut self, path: Option<PathBuf>) -> Self {
        self.board_path = path;
        self
    }

    pub fn model(&self) -> Option<&Arc<dyn ChatModel>> {
        self.model.as_ref()
    }

    fn model_name(&self) -> &str {
        self.model.as_ref().map(|m| m.model_name()).unwrap_or("")
    }

    /// Answer a question and update the answer board.
    pub async fn ask(&self, question: &str) -> AnswerRecord {
        self.ask_with_board(question, true).await
    }

    /// Answer a question; the board is only written when `write_board` is
    /// set and a board path is configured.
    pub async fn ask_with_board(&self, question: &str, write_board: bool) -> AnswerRecord {
        let span = tracing::info_span!("ask", run_id = %Uuid::new_v4());
        async move {
            let record = self.run(question).await;
            if write_board && record.stage == Stage::Answered {
                if let Some(path) = &self.board_path {
                    if let Err(e) = board::write_answer_board(path, question, &record.answer) {
                        tracing::warn!(error = %e, "failed to write answer board");
                    }
                }
            }
            record
        }
        .instrument(span)
        .await
    }

    async fn select(&self, system: &str, human: String) -> Option<String> {
        let model = self.model.as_ref()?;
        match model
            .invoke(&[ChatMessage::system(system), ChatMessage::human(human)])
            .await
        {
            Ok(reply) => Some(reply),
            Err(e) => {
                tracing::warn!(error = %e, "selection call failed");
                None
            }
        }
    }

    async fn run(&self, question: &str) -> AnswerRecord {
        if question.trim().is_empty() {
            return AnswerRecord::degraded(question, EMPTY_QUESTION, Stage::Tagged);
        }
        tracing::info!(question, "processing question");

        // Tagged
        let tags = self.tagger.extract(question).await;
        tracing::debug!(?tags, "retrieval tags");

        // Overviewed
        let overview = self.backend.overview(&tags).await;
        if !overview.is_success() {
            tracing::warn!(
                stage = "overview",
                error = overview.message().unwrap_or("unknown"),
                "stage failed"
            );
            return AnswerRecord {
                tags,
                ..AnswerRecord::degraded(question, DIRECTORY_RETRIEVAL_FAILED, Stage::Tagged)
            };
        }
        let tree_text = overview.result_text();
        tracing::debug!(chars = tree_text.len(), "overview received");

        // FilesSelected
        let file_ids = self
            .select(
                FILE_SELECTION_PROMPT,
                format!("Question: {}\nDirectory:\n{}", question, tree_text),
            )
            .await
            .map(|reply| parse_file_ids(&reply))
            .unwrap_or_default();
        if file_ids.is_empty() {
            tracing::warn!(stage = "select_files", "no file selected");
            return AnswerRecord {
                final_context: Some(tree_text),
                tags,
                ..AnswerRecord::degraded(question, NO_FILE_SELECTED, Stage::Overviewed)
            };
        }
        tracing::info!(?file_ids, "files selected");

        // StructureExpanded
        let expanded = self.backend.expand(&file_ids, &tags).await;
        if !expanded.is_success() {
            tracing::warn!(
                stage = "expand",
                error = expanded.message().unwrap_or("unknown"),
                "stage failed"
            );
            return AnswerRecord {
                final_context: Some(tree_text),
                tags,
                chosen_files: file_ids,
                ..AnswerRecord::degraded(question, FILE_EXPANSION_FAILED, Stage::FilesSelected)
            };
        }
        let expanded_text = expanded.result_text();
        tracing::debug!(chars = expanded_text.len(), "structure expanded");

        // NodesSelected
        let node_ids = self
            .select(
                NODE_SELECTION_PROMPT,
                format!("Question: {}\nStructure:\n{}", question, expanded_text),
            )
            .await
            .map(|reply| parse_node_ids(&reply))
            .unwrap_or_default();
        let structure_nodes = if node_ids.is_empty() {
            file_ids.iter().take(NODE_FALLBACK_FILES).cloned().collect()
        } else {
            node_ids
        };
        tracing::info!(?structure_nodes, "structure nodes selected");

        // Gathered
        let leaves = self
            .backend
            .gather(&structure_nodes, &tags)
            .await
            .unwrap_or_default();

        // SqlChecked
        let sql = self.sql.analyze(&leaves, question).await;
        let sql_text = sql.as_ref().map(SqlDecision::render).unwrap_or_default();

        let context_block = build_context_block(&expanded_text, &leaves, &sql_text);

        let model_name = self.model_name();
        let leaf_texts: Vec<&str> = leaves.iter().map(|l| l.context.as_str()).collect();
        let metrics = Metrics {
            expanded_chars: expanded_text.chars().count(),
            expanded_tokens: self.tokens.estimate(&expanded_text, model_name),
            leaf_stats: self.tokens.summarize(&leaf_texts, model_name),
            sql_chars: sql_text.chars().count(),
            sql_tokens: self.tokens.estimate(&sql_text, model_name),
        };
        tracing::debug!(?metrics, "context metrics");

        // Answered
        let answer = match &self.model {
            Some(model) => match model
                .invoke(&[
                    ChatMessage::system(ANSWER_PROMPT),
                    ChatMessage::human(format!(
                        "Question: {}\nContext:\n{}",
                        question, context_block
                    )),
                ])
                .await
            {
                Ok(answer) => answer,
                Err(e) => {
                    tracing::warn!(error = %e, "answer call failed");
                    format!("answer failed: {}", e)
                }
            },
            None => MODEL_UNAVAILABLE.to_string(),
        };

        AnswerRecord {
            question: question.to_string(),
            answer,
            final_context: Some(context_block),
            tags,
            chosen_files: file_ids,
            structure_nodes,
            gathered_leaf_count: leaves.len(),
            sql,
            metrics: Some(metrics),
            stage: Stage::Answered,
        }
    }
}
