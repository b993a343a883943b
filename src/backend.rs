//! Typed calls to the retrieval backend's tool surface.
//!
//! | Tool | Parameters | Used by |
//! |------|------------|---------|
//! | `search_documents` | `{mode: "overview", keywords}` | `ask` |
//! | `search_documents` | `{mode: "expand", ids, keywords}` | `ask` |
//! | `gather_context` | `{node_ids, keywords}` | `ask` |
//! | `start_document_build` | `{file_path?}` | CLI `build` |
//! | `get_job_status` | `{job_id}` | CLI `status` |
//! | `directory_tree_builder` | `{}` | CLI `tree` |
//!
//! Every call goes through the [`ToolInvoker`], so results are normalized
//! and failures come back as `status = "error"` records.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::invoker::{ToolInvoker, ToolOutput};
use crate::models::{LeafContext, NodeType};

pub const SEARCH_DOCUMENTS: &str = "search_documents";
pub const GATHER_CONTEXT: &str = "gather_context";
pub const START_DOCUMENT_BUILD: &str = "start_document_build";
pub const GET_JOB_STATUS: &str = "get_job_status";
pub const DIRECTORY_TREE_BUILDER: &str = "directory_tree_builder";

pub struct BackendClient {
    invoker: Arc<ToolInvoker>,
}

impl BackendClient {
    pub fn new(invoker: Arc<ToolInvoker>) -> Self {
        Self { invoker }
    }

    /// Corpus-wide directory tree annotated with ids and hit markers.
    pub async fn overview(&self, tags: &[String]) -> ToolOutput {
        self.invoker
            .call(
                SEARCH_DOCUMENTS,
                json!({ "mode": "overview", "keywords": tags }),
            )
            .await
    }

    /// Internal structure of the selected files.
    pub async fn expand(&self, ids: &[String], tags: &[String]) -> ToolOutput {
        self.invoker
            .call(
                SEARCH_DOCUMENTS,
                json!({ "mode": "expand", "ids": ids, "keywords": tags }),
            )
            .await
    }

    /// Leaves under the selected nodes, flattened in node order.
    /// `None` when the backend does not report success.
    pub async fn gather(&self, node_ids: &[String], tags: &[String]) -> Option<Vec<LeafContext>> {
        let out = self
            .invoker
            .call(
                GATHER_CONTEXT,
                json!({ "node_ids": node_ids, "keywords": tags }),
            )
            .await;
        if out.is_success() {
            Some(parse_leaves(&out))
        } else {
            tracing::warn!(
                error = out.message().unwrap_or("unknown"),
                "gather_context failed"
            );
            None
        }
    }

    pub async fn start_build(&self, file_path: Option<&str>) -> ToolOutput {
        let params = match file_path {
            Some(path) => json!({ "file_path": path }),
            None => json!({}),
        };
        self.invoker.call(START_DOCUMENT_BUILD, params).await
    }

    pub async fn job_status(&self, job_id: &str) -> ToolOutput {
        self.invoker
            .call(GET_JOB_STATUS, json!({ "job_id": job_id }))
            .await
    }

    pub async fn build_tree(&self) -> ToolOutput {
        self.invoker.call(DIRECTORY_TREE_BUILDER, json!({})).await
    }
}

fn text_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
        Some(Value::Null) | None => false,
    }
}

/// Flatten `nodes[].leaves[]` of a `gather_context` result.
pub fn parse_leaves(output: &ToolOutput) -> Vec<LeafContext> {
    let Some(nodes) = output.get("nodes").and_then(|n| n.as_array()) else {
        return Vec::new();
    };
    nodes
        .iter()
        .filter_map(|node| node.get("leaves").and_then(|l| l.as_array()))
        .flatten()
        .map(|leaf| LeafContext {
            id: text_of(leaf.get("id")),
            context: text_of(leaf.get("context")),
            node_type: NodeType::parse(
                leaf.get("node_type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("leaf"),
            ),
            hit: truthy(leaf.get("hit")),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_leaves_flattens_in_order() {
        let out = ToolOutput::from_raw(json!({
            "status": "success",
            "nodes": [
                { "leaves": [
                    { "id": 3, "context": "alpha", "node_type": "leaf", "hit": true },
                    { "id": "4", "context": "beta" }
                ]},
                { "title": "no leaves" },
                { "leaves": [
                    { "id": 9, "context": "SCHEMA: a", "node_type": "csv_excel", "hit": 0 }
                ]}
            ]
        }));
        let leaves = parse_leaves(&out);
        assert_eq!(leaves.len(), 3);
        assert_eq!(leaves[0].id, "3");
        assert!(leaves[0].hit);
        assert_eq!(leaves[1].id, "4");
        assert_eq!(leaves[1].node_type, NodeType::Leaf);
        assert!(!leaves[1].hit);
        assert!(leaves[2].node_type.is_tabular());
        assert!(!leaves[2].hit);
    }

    #[test]
    fn test_parse_leaves_without_nodes() {
        let out = ToolOutput::from_raw(json!({ "status": "success" }));
        assert!(parse_leaves(&out).is_empty());
    }
}
