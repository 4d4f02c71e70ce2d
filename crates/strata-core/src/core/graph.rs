//! Knowledge graph model.
//!
//! Nodes are questions, sources and insights laid out on a 2-D canvas; edges
//! link a parent to a child. The graph has a single write path: change
//! handlers from the canvas and atomic commits from the planner.

use std::collections::HashMap;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest excerpt forwarded in a graph snapshot.
const SNAPSHOT_EXCERPT_MAX_CHARS: usize = 280;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Question,
    Source,
    Insight,
}

/// Type-specific node content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeData {
    Question {
        text: String,
    },
    Source {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Insight {
        title: String,
        #[serde(default)]
        excerpt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(default)]
    pub position: Position,
    #[serde(flatten)]
    pub data: NodeData,
}

impl GraphNode {
    pub fn question(id: impl Into<String>, text: impl Into<String>, position: Position) -> Self {
        Self {
            id: id.into(),
            position,
            data: NodeData::Question { text: text.into() },
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self.data {
            NodeData::Question { .. } => NodeType::Question,
            NodeData::Source { .. } => NodeType::Source,
            NodeData::Insight { .. } => NodeType::Insight,
        }
    }

    pub fn label(&self) -> Option<&str> {
        let label = match &self.data {
            NodeData::Question { text } => text.as_str(),
            NodeData::Source { url, title } => title.as_deref().unwrap_or(url),
            NodeData::Insight { title, .. } => title.as_str(),
        };
        let label = label.trim();
        (!label.is_empty()).then_some(label)
    }

    pub fn excerpt(&self) -> Option<&str> {
        match &self.data {
            NodeData::Insight { excerpt, .. } => {
                let excerpt = excerpt.trim();
                (!excerpt.is_empty()).then_some(excerpt)
            }
            NodeData::Question { .. } | NodeData::Source { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
}

impl Edge {
    /// Parent-to-child edge with a deterministic id.
    pub fn link(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("edge-{source}-{target}"),
            source,
            target,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("edge {edge_id} references missing node {node_id}")]
    MissingEndpoint { edge_id: String, node_id: String },
    #[error("node {0} already exists")]
    DuplicateNode(String),
}

/// Canvas edits routed through the graph's write path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeChange {
    Move { id: String, position: Position },
    Remove { id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EdgeChange {
    Add { edge: Edge },
    Remove { id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    /// Number of edges leaving `id`.
    pub fn child_count(&self, id: &str) -> usize {
        self.edges.iter().filter(|edge| edge.source == id).count()
    }

    /// Adds `nodes` and `edges` together, or nothing at all.
    ///
    /// Every new node id must be fresh and every edge endpoint must exist
    /// once the new nodes are in.
    pub fn commit(&mut self, nodes: Vec<GraphNode>, edges: Vec<Edge>) -> Result<(), GraphError> {
        let mut ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        for node in &nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }
        for edge in &edges {
            for endpoint in [&edge.source, &edge.target] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(GraphError::MissingEndpoint {
                        edge_id: edge.id.clone(),
                        node_id: endpoint.clone(),
                    });
                }
            }
        }

        self.nodes.extend(nodes);
        self.edges.extend(edges);
        Ok(())
    }

    /// Applies canvas node edits. Removing a node drops its edges.
    pub fn apply_node_changes(&mut self, changes: Vec<NodeChange>) {
        for change in changes {
            match change {
                NodeChange::Move { id, position } => {
                    if let Some(node) = self.nodes.iter_mut().find(|node| node.id == id) {
                        node.position = position;
                    }
                }
                NodeChange::Remove { id } => {
                    self.nodes.retain(|node| node.id != id);
                    self.edges
                        .retain(|edge| edge.source != id && edge.target != id);
                }
            }
        }
    }

    /// Applies canvas edge edits. Stops at the first edge whose endpoints
    /// are missing; earlier changes stay applied.
    pub fn apply_edge_changes(&mut self, changes: Vec<EdgeChange>) -> Result<(), GraphError> {
        for change in changes {
            match change {
                EdgeChange::Add { edge } => {
                    for endpoint in [&edge.source, &edge.target] {
                        if !self.contains(endpoint) {
                            return Err(GraphError::MissingEndpoint {
                                edge_id: edge.id.clone(),
                                node_id: endpoint.clone(),
                            });
                        }
                    }
                    if !self.edges.iter().any(|existing| existing.id == edge.id) {
                        self.edges.push(edge);
                    }
                }
                EdgeChange::Remove { id } => self.edges.retain(|edge| edge.id != id),
            }
        }
        Ok(())
    }
}

// ============================================================================
// Snapshot sent to the proposal service
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotNode {
    pub int_id: u32,
    pub node_id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEdge {
    pub source_int_id: u32,
    pub target_int_id: u32,
}

/// Flattened graph: nodes numbered from 1 in graph order, edges as pairs of
/// those numbers. Edges with a dangling endpoint are left out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<SnapshotNode>,
    pub edges: Vec<SnapshotEdge>,
}

impl GraphSnapshot {
    pub fn from_graph(graph: &Graph) -> Self {
        let mut int_ids: HashMap<&str, u32> = HashMap::with_capacity(graph.nodes.len());
        let nodes = graph
            .nodes
            .iter()
            .zip(1u32..)
            .map(|(node, int_id)| {
                int_ids.insert(node.id.as_str(), int_id);
                SnapshotNode {
                    int_id,
                    node_id: node.id.clone(),
                    node_type: node.node_type(),
                    label: node.label().map(str::to_string),
                    excerpt: node
                        .excerpt()
                        .map(|e| e.chars().take(SNAPSHOT_EXCERPT_MAX_CHARS).collect()),
                }
            })
            .collect();

        let edges = graph
            .edges
            .iter()
            .filter_map(|edge| {
                Some(SnapshotEdge {
                    source_int_id: *int_ids.get(edge.source.as_str())?,
                    target_int_id: *int_ids.get(edge.target.as_str())?,
                })
            })
            .collect();

        Self { nodes, edges }
    }

    /// Real node id behind a snapshot number.
    pub fn node_id(&self, int_id: u32) -> Option<&str> {
        self.nodes
            .iter()
            .find(|node| node.int_id == int_id)
            .map(|node| node.node_id.as_str())
    }
}
