//! Markdown artifact boards.
//!
//! Each board is a single file overwritten on every run: `ask.md` holds the
//! latest question and answer, `report.md` the latest report. Writes are
//! best-effort; callers log failures and carry on.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;

fn timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn render_answer_board(question: &str, answer: &str) -> String {
    format!(
        "# Latest Answer\n\n_Updated {}_\n\n**Question**\n\n{}\n\n**Answer**\n\n{}\n",
        timestamp(),
        question,
        answer
    )
}

pub fn render_report_board(main_question: &str, sub_questions: &[String], report: &str) -> String {
    let subs = sub_questions
        .iter()
        .map(|q| format!("- {}", q))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# Report\n\n_Updated {}_\n\n**Main Question**\n\n{}\n\n**Sub-questions**\n\n{}\n\n**Final Report**\n\n{}\n",
        timestamp(),
        main_question,
        subs,
        report
    )
}

fn write_board(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write board: {}", path.display()))
}

pub fn write_answer_board(path: &Path, question: &str, answer: &str) -> Result<()> {
    write_board(path, &render_answer_board(question, answer))
}

pub fn write_report_board(
    path: &Path,
    main_question: &str,
    sub_questions: &[String],
    report: &str,
) -> Result<()> {
    write_board(path, &render_report_board(main_question, sub_questions, report))
}
