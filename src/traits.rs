//! Extension traits for backend tools.
//!
//! Every backend capability the pipeline consumes (`search_documents`,
//! `gather_context`, `sql_tool`, the corpus build tools) is reached through
//! a [`Tool`] registered in a [`ToolRegistry`]. Adapters decide how a call
//! is actually made:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              ToolRegistry                │
//! │  ┌─────────┐ ┌──────────┐ ┌───────────┐ │
//! │  │  MCP    │ │ Blocking │ │  Custom   │ │
//! │  │ (HTTP)  │ │  (sync)  │ │  (Rust)   │ │
//! │  └─────────┘ └──────────┘ └───────────┘ │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        ToolInvoker::call() → normalized output
//! ```
//!
//! # Usage
//!
//! ```rust
//! use quiknow::traits::{BlockingTool, ToolRegistry};
//!
//! let mut tools = ToolRegistry::new();
//! tools.register(Box::new(BlockingTool::new("echo", |params| Ok(params))));
//! assert!(tools.find("echo").is_some());
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

/// A backend tool the pipeline can call.
///
/// Implementations return the raw result of the call. The
/// [`ToolInvoker`](crate::invoker::ToolInvoker) applies the timeout and
/// normalizes whatever comes back (objects, JSON text, plain text, other
/// values) into a status-carrying record, so adapters should not try to
/// shape their output.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use serde_json::{json, Value};
/// use quiknow::traits::Tool;
///
/// pub struct JobStatusTool;
///
/// #[async_trait]
/// impl Tool for JobStatusTool {
///     fn name(&self) -> &str { "get_job_status" }
///
///     async fn invoke(&self, params: Value) -> Result<Value> {
///         Ok(json!({ "status": "success", "job_id": params["job_id"] }))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool's name (e.g. `"search_documents"`).
    fn name(&self) -> &str;

    /// Returns a one-line description of the tool.
    fn description(&self) -> &str {
        ""
    }

    /// Invoke the tool with a JSON parameter object.
    ///
    /// Errors are reported to the caller as `{status: "error", message}`
    /// by the invoker; they never abort a pipeline run.
    async fn invoke(&self, params: Value) -> Result<Value>;
}

// ═══════════════════════════════════════════════════════════════════════
// BlockingTool
// ═══════════════════════════════════════════════════════════════════════

type BlockingFn = dyn Fn(Value) -> Result<Value> + Send + Sync;

/// Adapter for synchronous tool handles.
///
/// The wrapped function runs on tokio's blocking thread pool so a slow
/// handle never stalls the async pipeline.
pub struct BlockingTool {
    name: String,
    func: Arc<BlockingFn>,
}

impl BlockingTool {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl Tool for BlockingTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, params: Value) -> Result<Value> {
        let func = self.func.clone();
        tokio::task::spawn_blocking(move || func(params))
            .await
            .with_context(|| format!("blocking tool '{}' panicked", self.name))?
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Registry of backend tools, looked up by name.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty tool registry.
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool. Lookup returns the first tool registered under a name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    /// Find a tool by name.
    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Return the count of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
