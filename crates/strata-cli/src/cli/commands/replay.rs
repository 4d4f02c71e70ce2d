//! Replay command: recorded turns in, reconciled transcript out.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use strata_core::core::message::Message;
use strata_core::core::persistence::ProjectSnapshot;
use strata_core::core::reconcile::{LiveEvents, reconcile};
use strata_core::core::timeline::{FallbackClock, map_turns};
use strata_core::core::tool_events::aggregate;
use strata_core::core::turn::{StreamState, StreamStatus, Turn};
use tracing::debug;

pub struct ReplayOptions<'a> {
    pub turns: &'a Path,
    pub status: Option<StreamStatus>,
    pub error: Option<String>,
    pub persisted: Option<&'a Path>,
}

/// Recordings are either a bare turn list or a full stream snapshot.
#[derive(Deserialize)]
#[serde(untagged)]
enum Recording {
    Turns(Vec<Turn>),
    Stream(StreamState),
}

pub fn run(options: &ReplayOptions<'_>) -> Result<()> {
    let transcript = replay(options)?;
    let json = serde_json::to_string_pretty(&transcript).context("serialize transcript")?;
    println!("{json}");
    Ok(())
}

fn replay(options: &ReplayOptions<'_>) -> Result<Vec<Message>> {
    let contents = fs::read_to_string(options.turns)
        .with_context(|| format!("read turns from {}", options.turns.display()))?;
    let recording: Recording = serde_json::from_str(&contents)
        .with_context(|| format!("parse turns from {}", options.turns.display()))?;

    let mut stream = match recording {
        Recording::Turns(turns) => StreamState {
            turns,
            ..StreamState::default()
        },
        Recording::Stream(stream) => stream,
    };
    if let Some(status) = options.status {
        stream.status = status;
    }
    if let Some(error) = &options.error {
        stream.error = Some(error.clone());
    }

    let persisted: Vec<Message> = match options.persisted {
        Some(path) => {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read snapshot from {}", path.display()))?;
            let snapshot: ProjectSnapshot = serde_json::from_str(&contents)
                .with_context(|| format!("parse snapshot from {}", path.display()))?;
            snapshot.tool_events().cloned().collect()
        }
        None => Vec::new(),
    };
    debug!(
        turns = stream.turns.len(),
        persisted = persisted.len(),
        "Replaying recording"
    );

    let mut clock = FallbackClock::default();
    let base = map_turns(&stream, &mut clock);
    let live = LiveEvents::new(aggregate(&stream, &mut clock), Vec::new(), Vec::new());
    Ok(reconcile(base, &persisted, &live))
}
