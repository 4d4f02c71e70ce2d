//! Plan command: runs the graph mutation planner offline.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use strata_core::core::graph::{Graph, GraphSnapshot};
use strata_core::core::layout::FanOutLayout;
use strata_core::core::planner;
use strata_core::core::services::{Proposal, ProposalResponse};
use tracing::info;

/// Proposal files hold a service response or just its node list.
#[derive(Deserialize)]
#[serde(untagged)]
enum ProposalFile {
    Nodes(Vec<Proposal>),
    Response(ProposalResponse),
}

pub fn run(graph_path: &Path, proposals_path: &Path, response_id: Option<&str>) -> Result<()> {
    let mut graph: Graph = read_json(graph_path, "graph")?;
    let proposals = match read_json::<ProposalFile>(proposals_path, "proposals")? {
        ProposalFile::Nodes(nodes) => nodes,
        ProposalFile::Response(response) => response.nodes,
    };

    let snapshot = GraphSnapshot::from_graph(&graph);
    let placement = planner::plan(
        &graph,
        &snapshot,
        &proposals,
        response_id,
        &FanOutLayout::default(),
    )?;
    let passes = placement.passes;
    let added = planner::commit(&mut graph, placement)?;
    info!(added = added.len(), passes, "Committed proposals");

    let json = serde_json::to_string_pretty(&graph).context("serialize graph")?;
    println!("{json}");
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read {what} from {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {what} from {}", path.display()))
}
