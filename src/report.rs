//! Decompose-and-synthesize report mode.
//!
//! [`ReportComposer::ask_report`] asks the model to split a question into
//! complementary sub-questions, answers each one with the [`RetrievalOrchestrator`]
//! (several at a time, results kept in sub-question order), then asks the
//! model for one structured report over all the answers.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use futures::stream::{self, StreamExt};
use regex::Regex;
use serde_json::{json, Value};
use tracing::Instrument;
use uuid::Uuid;

use crate::ask::{RetrievalOrchestrator, EMPTY_QUESTION};
use crate::board;
use crate::model::{ChatMessage, ChatModel, MODEL_UNAVAILABLE};
use crate::models::{truncate_chars, ReportRecord, SubResult};

/// Default cap on sub-questions per report.
pub const DEFAULT_MAX_SUB_QUESTIONS: usize = 5;

const MAX_SYNTHESIS_CHARS: usize = 12_000;

const DECOMPOSE_PROMPT: &str = "Split the user's question into 3-6 complementary sub-questions \
that cover different aspects.\n\
Output a JSON array of strings only, on a single line: no code fences, no objects, no extra text. \
Keep each item under 40 words. Example: [\"sub-question 1\", \"sub-question 2\"]";

const SYNTHESIS_PROMPT: &str = "Combine the sub-question answers into a structured report:\n\
1. Summary\n\
2. Key findings\n\
3. Data / evidence citations (if any)\n\
4. Risks or uncertainty\n\
5. Recommended next steps";

static BULLET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(?:[-*•]|\d+[.)])\s*").unwrap());

static QUESTION_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)^"?question"?\s*:\s*"#).unwrap());

fn question_of(item: &Value) -> Option<String> {
    let text = match item {
        Value::String(s) => s.as_str(),
        Value::Object(obj) => obj
            .get("question")
            .or_else(|| obj.get("q"))
            .and_then(|q| q.as_str())?,
        _ => return None,
    };
    let text = text.trim().trim_matches('"').trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn is_quoted(line: &str) -> bool {
    line.chars().count() >= 2
        && ((line.starts_with('"') && line.ends_with('"'))
            || (line.starts_with('\'') && line.ends_with('\'')))
}

fn questions_from_lines(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.starts_with("```") {
            continue;
        }
        if line.chars().count() <= 3 && line.starts_with(['[', ']', '{', '}', '-', '*']) {
            continue;
        }
        if matches!(line.to_lowercase().as_str(), "json" | "array") {
            continue;
        }
        let line = line.trim_end_matches(',');
        let line = if is_quoted(line) {
            &line[1..line.len() - 1]
        } else {
            line
        };
        let line = BULLET.replace(line, "");
        let line = QUESTION_KEY.replace(&line, "");
        let line = line.trim().trim_end_matches(',').trim_matches('"').trim();

        let len = line.chars().count();
        if (2..=80).contains(&len) && !line.chars().all(|c| "[]{}:,\"".contains(c)) {
            out.push(line.to_string());
        }
    }
    out
}

fn questions_from_json(text: &str) -> Option<Vec<String>> {
    let parsed: Value = serde_json::from_str(text).ok()?;
    let items: &[Value] = match &parsed {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => obj
            .get("questions")
            .and_then(|q| q.as_array())
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    };
    Some(items.iter().filter_map(question_of).collect())
}

fn strip_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Recover sub-questions from a decomposition reply.
///
/// Accepts a JSON array (of strings or `{question}`/`{q}` objects) or an
/// object with a `questions` array, optionally inside a code fence. Replies
/// that are not JSON fall back to line-by-line extraction.
pub fn parse_sub_questions(reply: &str) -> Vec<String> {
    let text = reply.trim();
    questions_from_json(text)
        .or_else(|| questions_from_json(strip_fences(text).trim()))
        .unwrap_or_else(|| questions_from_lines(text))
}

/// Builds multi-part reports on top of a [`RetrievalOrchestrator`].
pub struct ReportComposer {
    orchestrator: Arc<RetrievalOrchestrator>,
    model: Option<Arc<dyn ChatModel>>,
    concurrency: usize,
    report_path: Option<PathBuf>,
}

impl ReportComposer {
    pub fn new(orchestrator: Arc<RetrievalOrchestrator>) -> Self {
        let model = orchestrator.model().cloned();
        Self {
            orchestrator,
            model,
            concurrency: 1,
            report_path: None,
        }
    }

    /// Number of sub-questions answered at once (at least 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_report_path(mut self, path: Option<PathBuf>) -> Self {
        self.report_path = path;
        self
    }

    async fn decompose(&self, question: &str, max_sub_questions: usize) -> Vec<String> {
        let mut subs = match &self.model {
            Some(model) => match model
                .invoke(&[
                    ChatMessage::system(DECOMPOSE_PROMPT),
                    ChatMessage::human(question),
                ])
                .await
            {
                Ok(reply) => parse_sub_questions(&reply),
                Err(e) => {
                    tracing::warn!(error = %e, "decomposition call failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        if subs.is_empty() {
            subs.push(question.to_string());
        }
        subs.truncate(max_sub_questions.max(1));
        subs
    }

    async fn synthesize(&self, question: &str, sub_results: &[SubResult]) -> String {
        let Some(model) = &self.model else {
            return MODEL_UNAVAILABLE.to_string();
        };
        let payload = json!({
            "main_question": question,
            "sub_results": sub_results,
        })
        .to_string();
        let payload = truncate_chars(&payload, MAX_SYNTHESIS_CHARS);

        match model
            .invoke(&[
                ChatMessage::system(SYNTHESIS_PROMPT),
                ChatMessage::human(payload),
            ])
            .await
        {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "report synthesis failed");
                format!("report synthesis failed: {}", e)
            }
        }
    }

    /// Decompose, answer every sub-question, and synthesize a report.
    pub async fn ask_report(&self, question: &str, max_sub_questions: usize) -> ReportRecord {
        if question.trim().is_empty() {
            return ReportRecord {
                main_question: question.to_string(),
                sub_questions: Vec::new(),
                sub_results: Vec::new(),
                report: EMPTY_QUESTION.to_string(),
            };
        }

        let span = tracing::info_span!("report", run_id = %Uuid::new_v4());
        async move {
            let sub_questions = self.decompose(question, max_sub_questions).await;
            tracing::info!(count = sub_questions.len(), "sub-questions");

            let orchestrator = &self.orchestrator;
            let sub_results: Vec<SubResult> = stream::iter(sub_questions.iter().cloned())
                .map(|sq| async move {
                    let record = orchestrator.ask_with_board(&sq, false).await;
                    SubResult {
                        question: sq,
                        ..SubResult::from(record)
                    }
                })
                .buffered(self.concurrency)
                .collect()
                .await;

            let report = self.synthesize(question, &sub_results).await;

            if let Some(path) = &self.report_path {
                if let Err(e) = board::write_report_board(path, question, &sub_questions, &report)
                {
                    tracing::warn!(error = %e, "failed to write report board");
                }
            }

            ReportRecord {
                main_question: question.to_string(),
                sub_questions,
                sub_results,
                report,
            }
        }
        .instrument(span)
        .await
    }
}
