//! # QuiKnow CLI (`quiknow`)
//!
//! Ask questions against the retrieval backend, build multi-part reports,
//! and manage the backend's corpus.
//!
//! ## Usage
//!
//! ```bash
//! quiknow --config ./config/quiknow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `quiknow ask [QUESTION]` | Answer one question, or read questions interactively |
//! | `quiknow report QUESTION` | Decompose, answer, and synthesize a report |
//! | `quiknow build [--path P]` | Start a corpus build job on the backend |
//! | `quiknow status --job ID` | Show a build job's status |
//! | `quiknow tree` | Rebuild the backend directory tree |
//! | `quiknow check [--model NAME]` | Health-check the configured model |
//!
//! With no command, `quiknow` behaves like `quiknow ask`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use quiknow::ask::RetrievalOrchestrator;
use quiknow::backend::BackendClient;
use quiknow::config::{self, Config};
use quiknow::invoker::ToolInvoker;
use quiknow::logging;
use quiknow::mcp::McpToolClient;
use quiknow::model::{self, ChatModel};
use quiknow::report::ReportComposer;
use quiknow::sql::{SqlExecutor, SqliteExecutor};
use quiknow::tokens::TokenEstimator;

const DEFAULT_CONFIG: &str = "./config/quiknow.toml";

/// QuiKnow — staged question answering over a document and data corpus.
///
/// Configuration is read from `--config` (default `./config/quiknow.toml`);
/// when the default file does not exist, built-in defaults are used.
#[derive(Parser)]
#[command(
    name = "quiknow",
    about = "QuiKnow — staged, model-driven question answering over a document and data corpus",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question.
    ///
    /// With no question, reads questions from stdin until an empty line.
    /// Each answer is printed as a JSON record.
    Ask {
        /// Question text (words are joined with spaces).
        question: Vec<String>,
    },

    /// Build a multi-part report.
    ///
    /// Splits the question into sub-questions, answers each one, and
    /// synthesizes a structured report.
    Report {
        /// Main question text.
        #[arg(required = true)]
        question: Vec<String>,

        /// Maximum number of sub-questions (default from `[report]`).
        #[arg(long)]
        max_sub: Option<usize>,
    },

    /// Start a corpus build job on the backend.
    Build {
        /// File or directory to build; the backend default when omitted.
        #[arg(long)]
        path: Option<String>,
    },

    /// Show the status of a build job.
    Status {
        /// Job id returned by `build`.
        #[arg(long)]
        job: String,
    },

    /// Rebuild the backend directory tree.
    Tree,

    /// Health-check the configured chat model.
    Check {
        /// Model name to check instead of `[model].name`.
        #[arg(long)]
        model: Option<String>,
    },
}

fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None if Path::new(DEFAULT_CONFIG).exists() => config::load_config(Path::new(DEFAULT_CONFIG)),
        None => Ok(Config::default()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn connect_invoker(cfg: &Config) -> Result<Arc<ToolInvoker>> {
    let client = McpToolClient::connect(&cfg.backend.url).await?;
    let registry = client.registry().await?;
    tracing::info!(tools = registry.len(), "backend tools available");
    Ok(Arc::new(ToolInvoker::new(
        registry,
        cfg.backend.tool_timeout(),
    )))
}

fn build_model(cfg: &Config) -> Option<Arc<dyn ChatModel>> {
    match model::create_model(&cfg.model) {
        Ok(model) => model,
        Err(e) => {
            tracing::warn!(error = %e, "model unavailable, continuing without one");
            None
        }
    }
}

async fn build_orchestrator(cfg: &Config) -> Result<RetrievalOrchestrator> {
    let invoker = connect_invoker(cfg).await?;
    let timeout = invoker.timeout();
    let orchestrator =
        RetrievalOrchestrator::new(invoker, build_model(cfg), Arc::new(TokenEstimator::new()));

    let orchestrator = match cfg.sql.backend.as_str() {
        "sqlite" => {
            let path = cfg
                .sql
                .sqlite_path
                .as_deref()
                .context("sql.sqlite_path must be set when sql.backend is 'sqlite'")?;
            let executor: Arc<dyn SqlExecutor> =
                Arc::new(SqliteExecutor::open(path, timeout).await?);
            orchestrator.with_sql_executor(Some(executor))
        }
        "disabled" => orchestrator.with_sql_executor(None),
        _ => orchestrator,
    };

    let board_path = cfg
        .artifacts
        .enabled
        .then(|| cfg.artifacts.board_path.clone());
    Ok(orchestrator.with_board_path(board_path))
}

async fn run_interactive(orchestrator: &RetrievalOrchestrator) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stderr = tokio::io::stderr();
    loop {
        stderr.write_all(b"question> ").await?;
        stderr.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            break;
        }
        print_json(&orchestrator.ask(question).await)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load(cli.config.as_deref())?;
    logging::init_logging(&cfg.logging);

    let command = cli.command.unwrap_or(Commands::Ask {
        question: Vec::new(),
    });

    match command {
        Commands::Ask { question } => {
            let orchestrator = build_orchestrator(&cfg).await?;
            let question = question.join(" ");
            if question.trim().is_empty() {
                run_interactive(&orchestrator).await?;
            } else {
                print_json(&orchestrator.ask(&question).await)?;
            }
        }
        Commands::Report { question, max_sub } => {
            let orchestrator = build_orchestrator(&cfg).await?;
            let report_path = cfg
                .artifacts
                .enabled
                .then(|| cfg.artifacts.report_path.clone());
            let composer = ReportComposer::new(Arc::new(orchestrator))
                .with_concurrency(cfg.report.concurrency)
                .with_report_path(report_path);
            let max_sub = max_sub.unwrap_or(cfg.report.max_sub_questions);
            print_json(&composer.ask_report(&question.join(" "), max_sub).await)?;
        }
        Commands::Build { path } => {
            let backend = BackendClient::new(connect_invoker(&cfg).await?);
            print_json(&backend.start_build(path.as_deref()).await.into_value())?;
        }
        Commands::Status { job } => {
            let backend = BackendClient::new(connect_invoker(&cfg).await?);
            print_json(&backend.job_status(&job).await.into_value())?;
        }
        Commands::Tree => {
            let backend = BackendClient::new(connect_invoker(&cfg).await?);
            print_json(&backend.build_tree().await.into_value())?;
        }
        Commands::Check { model: name } => {
            let mut model_cfg = cfg.model.clone();
            if let Some(name) = name {
                model_cfg.name = name;
            }
            print_json(&model::check_model(&model_cfg).await)?;
        }
    }

    Ok(())
}
