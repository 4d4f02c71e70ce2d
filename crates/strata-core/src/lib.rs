//! Core Strata library (timeline reconciliation, graph planning, config).

pub mod config;
pub mod core;
