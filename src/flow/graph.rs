use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FlowError, FlowResult};
use crate::flow::{Edge, FlowData, Node, NodeData, Position};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NodeChange {
    Add(Node),
    Move { id: String, position: Position },
    /// Shallow merge into `data.config`.
    UpdateConfig { id: String, config: Map<String, Value> },
    ReplaceData { id: String, data: NodeData },
    SetStop { id: String, stop: bool },
    Remove { id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EdgeChange {
    Add(Edge),
    Remove { id: String },
}

/// Mutable view over the nodes and edges of a flow that keeps edges pointing at
/// existing nodes.
pub struct Graph<'a> {
    data: &'a mut FlowData,
}

impl<'a> Graph<'a> {
    pub fn new(data: &'a mut FlowData) -> Self {
        Self { data }
    }

    pub fn apply_node_change(&mut self, change: NodeChange) -> FlowResult<()> {
        match change {
            NodeChange::Add(node) => self.add_node(node),
            NodeChange::Move { id, position } => {
                self.node_mut(&id)?.position = position;
                Ok(())
            }
            NodeChange::UpdateConfig { id, config } => {
                self.node_mut(&id)?.data.config.extend(config);
                Ok(())
            }
            NodeChange::ReplaceData { id, data } => {
                self.node_mut(&id)?.data = data;
                Ok(())
            }
            NodeChange::SetStop { id, stop } => {
                self.node_mut(&id)?.data.stop = Some(stop);
                Ok(())
            }
            NodeChange::Remove { id } => self.remove_node(&id).map(|_| ()),
        }
    }

    pub fn apply_edge_change(&mut self, change: EdgeChange) -> FlowResult<()> {
        match change {
            EdgeChange::Add(edge) => self.add_edge(edge),
            EdgeChange::Remove { id } => self.remove_edge(&id).map(|_| ()),
        }
    }

    pub fn add_node(&mut self, node: Node) -> FlowResult<()> {
        if self.data.node(&node.id).is_some() {
            return Err(FlowError::Validation(format!(
                "node id `{}` is already used",
                node.id
            )));
        }
        self.data.nodes.push(node);
        Ok(())
    }

    /// Removes the node and every edge that starts or ends at it.
    pub fn remove_node(&mut self, id: &str) -> FlowResult<Node> {
        let pos = self
            .data
            .nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| FlowError::NodeNotFound(id.to_string()))?;
        let node = self.data.nodes.remove(pos);
        self.data.edges.retain(|e| !e.touches(id));
        Ok(node)
    }

    pub fn add_edge(&mut self, edge: Edge) -> FlowResult<()> {
        check_edge(self.data, &edge)?;
        if self.data.edge(&edge.id).is_some() {
            return Err(FlowError::Validation(format!(
                "edge id `{}` is already used",
                edge.id
            )));
        }
        if self.data.edges.iter().any(|e| e.same_connection(&edge)) {
            return Err(FlowError::Validation(format!(
                "`{}` is already connected to `{}`",
                edge.source, edge.target
            )));
        }
        self.data.edges.push(edge);
        Ok(())
    }

    pub fn remove_edge(&mut self, id: &str) -> FlowResult<Edge> {
        let pos = self
            .data
            .edges
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| FlowError::EdgeNotFound(id.to_string()))?;
        Ok(self.data.edges.remove(pos))
    }

    fn node_mut(&mut self, id: &str) -> FlowResult<&mut Node> {
        self.data
            .nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| FlowError::NodeNotFound(id.to_string()))
    }
}

/// Validates a whole graph, e.g. one pasted into the editor.
pub fn check_integrity(data: &FlowData) -> FlowResult<()> {
    let mut node_ids = HashSet::with_capacity(data.nodes.len());
    for node in &data.nodes {
        if !node_ids.insert(node.id.as_str()) {
            return Err(FlowError::Validation(format!(
                "node id `{}` is used twice",
                node.id
            )));
        }
    }
    let mut edge_ids = HashSet::with_capacity(data.edges.len());
    for edge in &data.edges {
        if !edge_ids.insert(edge.id.as_str()) {
            return Err(FlowError::Validation(format!(
                "edge id `{}` is used twice",
                edge.id
            )));
        }
        check_edge(data, edge)?;
    }
    Ok(())
}

fn check_edge(data: &FlowData, edge: &Edge) -> FlowResult<()> {
    let Some(source) = data.node(&edge.source) else {
        return Err(FlowError::ReferentialViolation {
            edge: edge.id.clone(),
            node: edge.source.clone(),
        });
    };
    if data.node(&edge.target).is_none() {
        return Err(FlowError::ReferentialViolation {
            edge: edge.id.clone(),
            node: edge.target.clone(),
        });
    }
    if edge.source == edge.target {
        return Err(FlowError::Validation(format!(
            "edge `{}` connects `{}` to itself",
            edge.id, edge.source
        )));
    }

    let ports = source.kind.source_handles();
    if !ports.is_empty() {
        match edge.source_handle.as_deref() {
            Some(handle) if ports.contains(&handle) => {}
            other => {
                return Err(FlowError::Validation(format!(
                    "edge `{}` leaves `{}` through port {:?}, expected one of {:?}",
                    edge.id, edge.source, other, ports
                )));
            }
        }
    }
    Ok(())
}
