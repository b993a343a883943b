//! MCP client adapter for the retrieval backend.
//!
//! Connects to the backend's MCP Streamable HTTP endpoint, discovers its
//! tools, and registers each one in a [`ToolRegistry`] as an [`McpTool`],
//! so the rest of the crate only ever sees the [`Tool`] trait.
//!
//! Call results are reduced to what the [`ToolInvoker`](crate::invoker::ToolInvoker)
//! normalizes: structured content is returned as JSON, otherwise the text
//! content blocks are joined into a string. An `isError` result becomes an
//! `Err`.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rmcp::model::CallToolRequestParams;
use rmcp::service::RunningService;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::{RoleClient, ServiceExt};
use serde_json::{json, Value};

use crate::traits::{Tool, ToolRegistry};

type McpSession = RunningService<RoleClient, ()>;

/// A live MCP session with the backend.
pub struct McpToolClient {
    session: Arc<McpSession>,
}

impl McpToolClient {
    /// Open a session against `url` (e.g. `http://127.0.0.1:9000/mcp`).
    pub async fn connect(url: &str) -> Result<Self> {
        let transport = StreamableHttpClientTransport::from_uri(url.to_string());
        let session = ()
            .serve(transport)
            .await
            .with_context(|| format!("Failed to connect to MCP backend at {}", url))?;
        tracing::info!(url, "connected to MCP backend");
        Ok(Self {
            session: Arc::new(session),
        })
    }

    /// List the backend's tools and wrap each as a [`Tool`].
    pub async fn tools(&self) -> Result<Vec<McpTool>> {
        let listed = self
            .session
            .list_all_tools()
            .await
            .context("Failed to list MCP tools")?;
        Ok(listed
            .into_iter()
            .map(|t| McpTool {
                name: t.name.to_string(),
                description: t.description.as_deref().unwrap_or_default().to_string(),
                session: self.session.clone(),
            })
            .collect())
    }

    /// Build a registry holding every backend tool.
    pub async fn registry(&self) -> Result<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        for tool in self.tools().await? {
            tracing::debug!(tool = %tool.name, "registered MCP tool");
            registry.register(Box::new(tool));
        }
        Ok(registry)
    }
}

/// One remote tool reached through an MCP session.
pub struct McpTool {
    name: String,
    description: String,
    session: Arc<McpSession>,
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(&self, params: Value) -> Result<Value> {
        let arguments = match params {
            Value::Object(map) => Value::Object(map),
            Value::Null => json!({}),
            other => bail!("tool parameters must be a JSON object, got {}", other),
        };
        let request: CallToolRequestParams =
            serde_json::from_value(json!({ "name": self.name, "arguments": arguments }))
                .context("Failed to build MCP tool call")?;

        let result = self
            .session
            .call_tool(request)
            .await
            .map_err(|e| anyhow!("MCP call to {} failed: {}", self.name, e))?;

        call_result_value(serde_json::to_value(&result)?)
    }
}

/// Reduce a serialized `CallToolResult` to the tool's raw output.
fn call_result_value(result: Value) -> Result<Value> {
    let text = result
        .get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    if result.get("isError").and_then(|e| e.as_bool()) == Some(true) {
        bail!("{}", if text.is_empty() { "tool reported an error" } else { &text });
    }

    match result.get("structuredContent") {
        Some(structured) if !structured.is_null() => Ok(structured.clone()),
        _ => Ok(Value::String(text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_content_is_joined() {
        let v = call_result_value(json!({
            "content": [
                { "type": "text", "text": "{\"status\":\"success\"," },
                { "type": "text", "text": "\"result\":\"tree\"}" }
            ]
        }))
        .unwrap();
        assert_eq!(
            v,
            Value::String("{\"status\":\"success\",\n\"result\":\"tree\"}".to_string())
        );
    }

    #[test]
    fn test_structured_content_preferred() {
        let v = call_result_value(json!({
            "content": [{ "type": "text", "text": "ignored" }],
            "structuredContent": { "status": "success", "nodes": [] }
        }))
        .unwrap();
        assert_eq!(v["status"], "success");
    }

    #[test]
    fn test_is_error_becomes_err() {
        let err = call_result_value(json!({
            "content": [{ "type": "text", "text": "job not found" }],
            "isError": true
        }))
        .unwrap_err();
        assert_eq!(err.to_string(), "job not found");
    }
}
