//! Graph mutation planning.
//!
//! Turns a batch of proposed insight nodes into concrete nodes and parent
//! edges. Proposals may hang off nodes created in the same batch, at any
//! depth, so placement runs as a bounded worklist over a private copy of
//! the graph: each pass places every group whose parent is already on the
//! working canvas, and the loop stops when a pass places nothing or the
//! pass budget runs out. Whatever is still pending afterwards has a parent
//! that never appears (dangling reference or cycle).
//!
//! Nothing touches the real graph until `commit`, which adds the whole
//! batch or nothing.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::graph::{Edge, Graph, GraphError, GraphNode, GraphSnapshot, NodeData};
use super::layout::{LayoutEngine, LayoutRequest};
use super::services::Proposal;

/// Title used when a proposal has neither title nor excerpt.
const UNTITLED_INSIGHT: &str = "Insight";
const TITLE_FROM_EXCERPT_MAX_CHARS: usize = 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("Unresolved parent for proposed nodes: {}", ids.join(", "))]
    UnresolvedParent { ids: Vec<String> },
    #[error("Layout failed: {0}")]
    Layout(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Nodes and edges ready to commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Placement {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<Edge>,
    pub passes: usize,
}

impl Placement {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|node| node.id.clone()).collect()
    }
}

/// A proposal with its final node id.
#[derive(Debug, Clone)]
struct Pending {
    node_id: String,
    proposal: Proposal,
}

/// Proposals waiting for the same parent reference.
#[derive(Debug)]
struct Group {
    parent_ref: String,
    members: Vec<Pending>,
}

/// Computes placement for `proposals` against `graph`.
///
/// `snapshot` is the flattened graph the proposals were generated from; it
/// resolves numeric parent references. `response_id` is recorded on nodes
/// whose proposal does not name its own backing response.
pub fn plan(
    graph: &Graph,
    snapshot: &GraphSnapshot,
    proposals: &[Proposal],
    response_id: Option<&str>,
    layout: &dyn LayoutEngine,
) -> Result<Placement, PlanError> {
    let (mut pending, aliases) = group_by_parent(graph, proposals);
    let mut working = graph.clone();
    let mut placement = Placement::default();
    let budget = proposals.len() + 2;

    while placement.passes < budget && !pending.is_empty() {
        placement.passes += 1;
        let mut placed_in_pass = 0;
        let mut still_pending = Vec::with_capacity(pending.len());

        for group in pending {
            let Some(parent_id) = resolve_parent(&group.parent_ref, &working, snapshot, &aliases)
            else {
                still_pending.push(group);
                continue;
            };
            let (nodes, edges) = place_group(&working, &parent_id, &group, response_id, layout)?;
            placed_in_pass += nodes.len();
            working.nodes.extend(nodes.iter().cloned());
            working.edges.extend(edges.iter().cloned());
            placement.nodes.extend(nodes);
            placement.edges.extend(edges);
        }

        pending = still_pending;
        debug!(
            pass = placement.passes,
            placed = placed_in_pass,
            pending = pending.len(),
            "Planner pass finished"
        );
        if placed_in_pass == 0 {
            break;
        }
    }

    if !pending.is_empty() {
        let ids = pending.into_iter().map(|group| group.parent_ref).collect();
        return Err(PlanError::UnresolvedParent { ids });
    }
    Ok(placement)
}

/// Adds a planned batch to the graph atomically. Returns the new node ids.
pub fn commit(graph: &mut Graph, placement: Placement) -> Result<Vec<String>, PlanError> {
    let ids = placement.node_ids();
    graph.commit(placement.nodes, placement.edges)?;
    Ok(ids)
}

/// Assigns node ids and groups proposals by parent reference in order of
/// first appearance. Also returns the map from declared proposal ids to the
/// node ids they were given.
fn group_by_parent(graph: &Graph, proposals: &[Proposal]) -> (Vec<Group>, HashMap<String, String>) {
    let mut taken: HashSet<String> = graph.nodes.iter().map(|node| node.id.clone()).collect();
    let mut aliases: HashMap<String, String> = HashMap::new();
    let mut groups: Vec<Group> = Vec::new();

    for proposal in proposals {
        let declared = proposal
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        let node_id = match declared {
            Some(id) if !taken.contains(id) => id.to_string(),
            _ => format!("insight-{}", Uuid::new_v4()),
        };
        taken.insert(node_id.clone());
        if let Some(declared) = declared {
            aliases
                .entry(declared.to_string())
                .or_insert_with(|| node_id.clone());
        }

        let parent_ref = proposal.parent_id.trim().to_string();
        let member = Pending {
            node_id,
            proposal: proposal.clone(),
        };
        match groups.iter_mut().find(|group| group.parent_ref == parent_ref) {
            Some(group) => group.members.push(member),
            None => groups.push(Group {
                parent_ref,
                members: vec![member],
            }),
        }
    }
    (groups, aliases)
}

/// Resolves a parent reference against the working canvas: a node id, then
/// a proposal id from this batch, then a snapshot number.
fn resolve_parent(
    parent_ref: &str,
    working: &Graph,
    snapshot: &GraphSnapshot,
    aliases: &HashMap<String, String>,
) -> Option<String> {
    if working.contains(parent_ref) {
        return Some(parent_ref.to_string());
    }
    if let Some(alias) = aliases.get(parent_ref).filter(|alias| working.contains(alias)) {
        return Some(alias.clone());
    }
    let int_id = parent_ref.parse::<u32>().ok()?;
    snapshot
        .node_id(int_id)
        .filter(|id| working.contains(id))
        .map(str::to_string)
}

fn place_group(
    working: &Graph,
    parent_id: &str,
    group: &Group,
    response_id: Option<&str>,
    layout: &dyn LayoutEngine,
) -> Result<(Vec<GraphNode>, Vec<Edge>), PlanError> {
    let parent = working
        .node(parent_id)
        .ok_or_else(|| PlanError::UnresolvedParent {
            ids: vec![group.parent_ref.clone()],
        })?;
    let insights: Vec<Proposal> = group.members.iter().map(|m| m.proposal.clone()).collect();

    let positions = layout
        .place_insight_nodes(&LayoutRequest {
            parent_node: parent,
            parent_position: parent.position,
            nodes: &working.nodes,
            edges: &working.edges,
            insights: &insights,
        })
        .map_err(|err| PlanError::Layout(format!("{err:#}")))?;
    if positions.len() != insights.len() {
        return Err(PlanError::Layout(format!(
            "expected {} positions under {parent_id}, got {}",
            insights.len(),
            positions.len()
        )));
    }

    let mut nodes = Vec::with_capacity(group.members.len());
    let mut edges = Vec::with_capacity(group.members.len());
    for (member, position) in group.members.iter().zip(positions) {
        nodes.push(GraphNode {
            id: member.node_id.clone(),
            position,
            data: insight_data(&member.proposal, response_id),
        });
        edges.push(Edge::link(parent_id, member.node_id.clone()));
    }
    Ok((nodes, edges))
}

fn insight_data(proposal: &Proposal, response_id: Option<&str>) -> NodeData {
    let excerpt = proposal.excerpt.trim().to_string();
    let title = match proposal.title.trim() {
        "" if excerpt.is_empty() => UNTITLED_INSIGHT.to_string(),
        "" => excerpt.chars().take(TITLE_FROM_EXCERPT_MAX_CHARS).collect(),
        title => title.to_string(),
    };
    NodeData::Insight {
        title,
        excerpt,
        response_id: proposal
            .response_id
            .clone()
            .or_else(|| response_id.map(str::to_string)),
    }
}
