//! Placement of new insight nodes on the canvas.

use anyhow::Result;

use super::graph::{Edge, GraphNode, Position};
use super::services::Proposal;

/// Inputs for placing one group of siblings under a parent.
#[derive(Debug, Clone, Copy)]
pub struct LayoutRequest<'a> {
    pub parent_node: &'a GraphNode,
    pub parent_position: Position,
    /// Every node currently on the (working) canvas.
    pub nodes: &'a [GraphNode],
    pub edges: &'a [Edge],
    pub insights: &'a [Proposal],
}

/// Geometric placement collaborator. Must return one position per insight,
/// in order.
pub trait LayoutEngine: Send + Sync {
    fn place_insight_nodes(&self, request: &LayoutRequest<'_>) -> Result<Vec<Position>>;
}

/// Places children in a row below their parent, continuing to the right of
/// any children the parent already has and skipping occupied spots.
#[derive(Debug, Clone, Copy)]
pub struct FanOutLayout {
    pub horizontal_gap: f64,
    pub vertical_gap: f64,
}

impl Default for FanOutLayout {
    fn default() -> Self {
        Self {
            horizontal_gap: 260.0,
            vertical_gap: 180.0,
        }
    }
}

impl FanOutLayout {
    fn occupied(&self, nodes: &[GraphNode], taken: &[Position], candidate: Position) -> bool {
        let min_x = self.horizontal_gap / 2.0;
        let min_y = self.vertical_gap / 2.0;
        let close = |p: &Position| (p.x - candidate.x).abs() < min_x && (p.y - candidate.y).abs() < min_y;
        nodes.iter().any(|node| close(&node.position)) || taken.iter().any(close)
    }
}

impl LayoutEngine for FanOutLayout {
    fn place_insight_nodes(&self, request: &LayoutRequest<'_>) -> Result<Vec<Position>> {
        let parent_id = request.parent_node.id.as_str();
        let existing = request
            .edges
            .iter()
            .filter(|edge| edge.source == parent_id)
            .count();
        let count = request.insights.len();
        let center = (count.saturating_sub(1)) as f64 / 2.0;
        let y = request.parent_position.y + self.vertical_gap;

        let mut placed: Vec<Position> = Vec::with_capacity(count);
        for slot in 0..count {
            let offset = (existing + slot) as f64 - center;
            let mut candidate =
                Position::new(request.parent_position.x + offset * self.horizontal_gap, y);
            while self.occupied(request.nodes, &placed, candidate) {
                candidate.x += self.horizontal_gap;
            }
            placed.push(candidate);
        }
        Ok(placed)
    }
}
