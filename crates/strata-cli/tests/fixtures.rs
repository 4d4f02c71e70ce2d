//! Recorded stream fixtures for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

/// Two turns: a question and an answer that ran one deep search, delivered
/// as two partial payloads.
pub const PARIS_TURNS: &str = include_str!("fixtures/paris_turns.json");

/// Writes `contents` to `name` inside `dir` and returns the path.
pub fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}
