//! CLI command handlers.

pub mod config;
pub mod plan;
pub mod replay;
