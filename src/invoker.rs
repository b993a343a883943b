//! Uniform, timeout-bounded tool invocation.
//!
//! [`ToolInvoker::call`] never fails: timeouts, adapter errors, and unknown
//! tool names all come back as a [`ToolOutput`] with `status = "error"`.
//! Successful results are normalized so callers can always look at the
//! `status` field:
//!
//! | Raw result | Normalized |
//! |------------|------------|
//! | JSON object | passed through |
//! | string holding a JSON object | parsed, passed through |
//! | string holding other JSON | `{status: "success", result: <parsed>}` |
//! | unparsable string | `{status: "raw", result: <string>}` |
//! | any other value | `{status: "success", result: <value>}` |

use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::traits::{Tool, ToolRegistry};

/// A normalized tool result. Always a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    fields: Map<String, Value>,
}

impl ToolOutput {
    /// Normalize a raw tool result.
    pub fn from_raw(raw: Value) -> Self {
        match raw {
            Value::Object(fields) => Self { fields },
            Value::String(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(fields)) => Self { fields },
                Ok(parsed) => Self::wrap("success", parsed),
                Err(_) => Self::wrap("raw", Value::String(text)),
            },
            other => Self::wrap("success", other),
        }
    }

    /// A failure record: `{status: "error", message}`.
    pub fn error(message: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!("error"));
        fields.insert("message".to_string(), Value::String(message.into()));
        Self { fields }
    }

    fn wrap(status: &str, result: Value) -> Self {
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!(status));
        fields.insert("result".to_string(), result);
        Self { fields }
    }

    pub fn status(&self) -> Option<&str> {
        self.fields.get("status").and_then(|s| s.as_str())
    }

    pub fn is_success(&self) -> bool {
        self.status() == Some("success")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// The `result` field rendered as text (strings verbatim, other JSON
    /// serialized, missing as empty).
    pub fn result_text(&self) -> String {
        match self.fields.get("result") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    /// Error description, if the output carries one.
    pub fn message(&self) -> Option<&str> {
        self.fields
            .get("message")
            .or_else(|| self.fields.get("error"))
            .and_then(|m| m.as_str())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// Invoke a single tool handle with a timeout, normalizing the outcome.
pub async fn invoke_tool(tool: &dyn Tool, params: Value, timeout: Duration) -> ToolOutput {
    let name = tool.name().to_string();
    match tokio::time::timeout(timeout, tool.invoke(params)).await {
        Ok(Ok(raw)) => ToolOutput::from_raw(raw),
        Ok(Err(e)) => {
            tracing::error!(tool = %name, error = %e, "tool call failed");
            ToolOutput::error(e.to_string())
        }
        Err(_) => {
            let message = format!("tool call timed out after {:.1}s", timeout.as_secs_f64());
            tracing::error!(tool = %name, error = %message, "tool call failed");
            ToolOutput::error(message)
        }
    }
}

/// Calls registered tools by name under a single timeout.
pub struct ToolInvoker {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolInvoker {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call the tool named `name`. Never fails; see the module docs.
    pub async fn call(&self, name: &str, params: Value) -> ToolOutput {
        match self.registry.find(name) {
            Some(tool) => invoke_tool(tool, params, self.timeout).await,
            None => {
                let message = format!("tool {} not found", name);
                tracing::error!(tool = %name, error = %message, "tool call failed");
                ToolOutput::error(message)
            }
        }
    }
}
