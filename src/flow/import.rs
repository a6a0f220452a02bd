//! Pasting and copying whole graphs.
//!
//! Accepts the `{ nodes, edges }` document the editor copies to the clipboard, as JSON or
//! YAML. Settings are optional. Export is always pretty JSON.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{FlowError, FlowResult};
use crate::flow::{Edge, FlowData, Node, Settings};

#[derive(Debug, Deserialize)]
struct GraphDocument {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    #[serde(default)]
    settings: Option<Settings>,
}

/// A parsed graph. `settings` is only set when the document carried them.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedGraph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub settings: Option<Settings>,
}

pub fn parse_graph(text: &str) -> FlowResult<ImportedGraph> {
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return Err(FlowError::Validation("graph document is empty".into()));
    }

    let value: Value = if trimmed.starts_with('{') {
        serde_json::from_str(trimmed)
            .map_err(|e| FlowError::Validation(format!("JSON parse error: {e}")))?
    } else {
        serde_yaml_bw::from_str(trimmed)
            .map_err(|e| FlowError::Validation(format!("YAML parse error: {e}")))?
    };

    let Value::Object(map) = &value else {
        return Err(FlowError::Validation("graph document must be an object".into()));
    };
    for key in ["nodes", "edges"] {
        if !map.get(key).is_some_and(Value::is_array) {
            return Err(FlowError::Validation(format!(
                "graph document needs a `{key}` array"
            )));
        }
    }

    let doc: GraphDocument = serde_json::from_value(value)
        .map_err(|e| FlowError::Validation(format!("invalid graph document: {e}")))?;
    Ok(ImportedGraph {
        nodes: doc.nodes,
        edges: doc.edges,
        settings: doc.settings,
    })
}

pub fn export_graph(data: &FlowData) -> FlowResult<String> {
    serde_json::to_string_pretty(data)
        .map_err(|e| FlowError::Validation(format!("could not serialize graph: {e}")))
}
