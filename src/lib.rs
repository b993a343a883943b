//! # QuiKnow
//!
//! Staged, model-driven question answering over a document and data corpus.
//!
//! QuiKnow does not index anything itself. It drives a remote retrieval
//! backend (reached over MCP) and a chat model through a narrowing search:
//! corpus overview, then a handful of files, then a handful of structural
//! nodes, then the leaves under them. Tabular leaves can additionally be
//! queried with sanitized, read-only SQL. A report mode splits a question
//! into sub-questions, answers each, and synthesizes the results.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐     ┌──────────────────────┐
//! │ ReportComposer │────▶│ RetrievalOrchestrator │
//! └────────────────┘     └──────────┬───────────┘
//!                                   │
//!          ┌────────────────┬───────┴────────┬──────────────┐
//!          ▼                ▼                ▼              ▼
//!   ┌─────────────┐  ┌─────────────┐  ┌─────────────┐ ┌───────────┐
//!   │ TagExtractor│  │BackendClient│  │ SqlAnalyzer │ │ ChatModel │
//!   └─────────────┘  └──────┬──────┘  └──────┬──────┘ └───────────┘
//!                           ▼                ▼
//!                    ┌─────────────────────────────┐
//!                    │ ToolInvoker → Tool (MCP, …) │
//!                    └─────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! quiknow ask "Q3 revenue by category"
//! quiknow report "How did the product line perform this year?" --max-sub 4
//! quiknow check
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | Tracing subscriber setup |
//! | [`models`] | Core data types |
//! | [`traits`] | `Tool` trait and registry |
//! | [`invoker`] | Timeout-bounded, normalized tool calls |
//! | [`mcp`] | MCP client adapter for backend tools |
//! | [`backend`] | Typed calls to the backend tool surface |
//! | [`model`] | Chat model trait and HTTP providers |
//! | [`tokens`] | Token estimation for metrics |
//! | [`tags`] | Retrieval keyword extraction |
//! | [`sql`] | Structured-query analysis and execution |
//! | [`ask`] | The staged retrieval pipeline |
//! | [`report`] | Decompose-and-synthesize reports |
//! | [`board`] | Markdown answer and report boards |

pub mod ask;
pub mod backend;
pub mod board;
pub mod config;
pub mod invoker;
pub mod logging;
pub mod mcp;
pub mod model;
pub mod models;
pub mod report;
pub mod sql;
pub mod tags;
pub mod tokens;
pub mod traits;
