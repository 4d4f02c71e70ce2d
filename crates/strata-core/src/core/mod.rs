//! Core module: the reconciliation and graph mutation engine.
//!
//! This module contains:
//! - `message`, `turn`, `payload`: transcript rows, raw stream turns and
//!   decoded tool payloads
//! - `timeline`: turns to transcript rows
//! - `tool_events`: coalescing of partial tool-call deliveries
//! - `reconcile`: merging persisted and live events into one transcript
//! - `graph`, `layout`, `planner`: the knowledge graph and batch placement
//! - `jobs`: in-flight work per chat
//! - `services`: remote collaborator traits and wire shapes
//! - `persistence`: chat snapshots on disk
//! - `session`: the orchestrator tying it all together

pub mod graph;
pub mod jobs;
pub mod layout;
pub mod message;
pub mod payload;
pub mod persistence;
pub mod planner;
pub mod reconcile;
pub mod services;
pub mod session;
pub mod timeline;
pub mod tool_events;
pub mod turn;
