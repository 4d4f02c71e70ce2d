//! Timeline mapping: raw turns to transcript rows.
//!
//! Mapping is a pure function of the stream snapshot, except for the
//! fallback clock, which remembers the timestamp it handed out for every id
//! so that re-mapping the same turn never moves it in time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::message::{Message, MessageStatus, Role};
use super::payload::{ToolFamily, ToolPayload};
use super::turn::{StreamState, StreamStatus, Turn};

/// Source of "now" for rows that arrive without a timestamp.
pub type Clock = fn() -> DateTime<Utc>;

/// Assigns a timestamp to an id on first sight and returns the same one
/// afterwards.
#[derive(Debug)]
pub struct FallbackClock {
    now: Clock,
    seen: HashMap<String, DateTime<Utc>>,
}

impl Default for FallbackClock {
    fn default() -> Self {
        Self::new(Utc::now)
    }
}

impl FallbackClock {
    pub fn new(now: Clock) -> Self {
        Self {
            now,
            seen: HashMap::new(),
        }
    }

    pub fn stamp(&mut self, id: &str) -> DateTime<Utc> {
        if let Some(ts) = self.seen.get(id) {
            return *ts;
        }
        let ts = (self.now)();
        self.seen.insert(id.to_string(), ts);
        ts
    }

    /// Current time without recording anything.
    pub fn now(&self) -> DateTime<Utc> {
        (self.now)()
    }
}

/// Maps every turn of `stream` to one transcript row.
pub fn map_turns(stream: &StreamState, clock: &mut FallbackClock) -> Vec<Message> {
    let latest_assistant = stream.latest_assistant().map(|turn| turn.id.as_str());

    stream
        .turns
        .iter()
        .map(|turn| {
            let first_seen = clock.stamp(&turn.id);
            let mut message = Message::text(turn.id.clone(), turn.role, turn_text(turn), first_seen);
            if let Some(raw) = turn
                .metadata
                .created_at
                .as_deref()
                .filter(|raw| !raw.trim().is_empty())
            {
                message.created_at = raw.to_string();
            }

            if turn.role == Role::Assistant {
                let is_latest = latest_assistant == Some(turn.id.as_str());
                let (status, error) = resolve_status(turn, is_latest, stream);
                message.status = Some(status);
                message.error = error;
            }
            message
        })
        .collect()
}

/// Text for a turn: explicit final answer, then the first tool result that
/// carries an answer, then the plain text parts.
pub fn turn_text(turn: &Turn) -> String {
    if let Some(answer) = turn
        .metadata
        .final_answer
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return answer.to_string();
    }

    let tool_answer = turn.tool_parts().find_map(|part| {
        let family = ToolFamily::from_tool_name(&part.tool_name)?;
        let payload = ToolPayload::decode(family, part.output.as_ref()?).ok()?;
        payload.answer().map(str::to_string)
    });

    tool_answer.unwrap_or_else(|| turn.plain_text())
}

fn resolve_status(
    turn: &Turn,
    is_latest: bool,
    stream: &StreamState,
) -> (MessageStatus, Option<String>) {
    if let Some(status) = turn.metadata.status.filter(|s| s.is_terminal()) {
        return (status, turn.metadata.error.clone());
    }
    if !is_latest {
        return (MessageStatus::Complete, None);
    }
    match stream.status {
        StreamStatus::Submitted | StreamStatus::Streaming => (MessageStatus::Pending, None),
        StreamStatus::Error => (
            MessageStatus::Failed,
            Some(
                stream
                    .error
                    .clone()
                    .unwrap_or_else(|| "The response stream failed".to_string()),
            ),
        ),
        StreamStatus::Idle => (MessageStatus::Complete, None),
    }
}
