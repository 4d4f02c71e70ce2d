//! Tool-event aggregation.
//!
//! Scans every turn for sub-agent and deep-search tool parts and coalesces
//! the repeated deliveries of each call into one transcript row. Graph
//! mutation events are not derived here: the session appends them
//! explicitly and only hands them to the reconciler.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use super::message::{Message, ToolInput, ToolStatus};
use super::payload::{DeepSearchPayload, SubagentPayload, ToolFamily, ToolPayload};
use super::timeline::FallbackClock;
use super::turn::{StreamState, ToolPart, ToolPartState};

/// Error text for a call whose turn ended without a terminal result.
pub const INTERRUPTED_CALL_ERROR: &str = "Tool call ended without a result";

/// Live tool events derived from the stream, one list per family.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolEvents {
    pub subagent: Vec<Message>,
    pub deep_search: Vec<Message>,
}

/// Fold state of one call id.
#[derive(Debug)]
struct CallFold {
    family: ToolFamily,
    call_id: String,
    tool_name: String,
    response_id: String,
    input: Value,
    subagent: Option<SubagentPayload>,
    deep_search: Option<DeepSearchPayload>,
    output: Option<Value>,
    error: Option<String>,
}

impl CallFold {
    fn new(family: ToolFamily, part: &ToolPart, response_id: &str) -> Self {
        Self {
            family,
            call_id: part.tool_call_id.clone(),
            tool_name: part.tool_name.clone(),
            response_id: response_id.to_string(),
            input: Value::Null,
            subagent: None,
            deep_search: None,
            output: None,
            error: None,
        }
    }

    fn absorb(&mut self, part: &ToolPart) {
        if !part.input.is_null() {
            self.input = part.input.clone();
        }

        if part.state == ToolPartState::OutputError {
            self.error = Some(
                part.error_text
                    .clone()
                    .unwrap_or_else(|| "Tool call failed".to_string()),
            );
        }

        let Some(raw) = part.output.as_ref() else {
            return;
        };
        match ToolPayload::decode(self.family, raw) {
            Ok(ToolPayload::Subagent(payload)) => {
                self.subagent = Some(payload);
                self.output = Some(raw.clone());
            }
            Ok(ToolPayload::DeepSearch(payload)) => {
                match self.deep_search.as_mut() {
                    Some(folded) => folded.fold(payload),
                    None => self.deep_search = Some(payload),
                }
                self.output = self
                    .deep_search
                    .as_ref()
                    .and_then(|folded| serde_json::to_value(folded).ok());
            }
            Err(err) => {
                debug!(call_id = %self.call_id, error = %err, "Rejected tool payload");
            }
        }
    }

    fn derived_status(&self) -> Option<ToolStatus> {
        if self.error.is_some() {
            return Some(ToolStatus::Failed);
        }
        match self.family {
            ToolFamily::Subagent => self.subagent.as_ref().and_then(SubagentPayload::status),
            ToolFamily::DeepSearch => self
                .deep_search
                .as_ref()
                .and_then(DeepSearchPayload::derived_status),
            ToolFamily::GraphMutation => None,
        }
    }

    fn content(&self) -> String {
        match self.family {
            ToolFamily::Subagent => self
                .subagent
                .as_ref()
                .and_then(SubagentPayload::answer)
                .unwrap_or_default()
                .to_string(),
            ToolFamily::DeepSearch => self
                .deep_search
                .as_ref()
                .map(DeepSearchPayload::summary)
                .unwrap_or_default(),
            ToolFamily::GraphMutation => String::new(),
        }
    }

    fn into_message(self, active_turn: Option<&str>, clock: &mut FallbackClock) -> Message {
        let kind = self.family.kind();
        let (status, error) = match self.derived_status() {
            Some(ToolStatus::Failed) => {
                let error = self
                    .error
                    .clone()
                    .or_else(|| self.deep_search.as_ref().and_then(|d| d.error.clone()));
                (ToolStatus::Failed, error)
            }
            Some(status) => (status, None),
            None if active_turn == Some(self.response_id.as_str()) => (ToolStatus::Running, None),
            None => (ToolStatus::Failed, Some(INTERRUPTED_CALL_ERROR.to_string())),
        };

        let id = kind.event_id(&self.call_id);
        let content = self.content();
        let input = ToolInput::new(Some(self.response_id), self.call_id).with_fields(&self.input);
        let mut message =
            Message::tool_event(kind, self.tool_name, input, status, clock.stamp(&id));
        message.content = content;
        message.tool_output = self.output;
        message.error = error;
        message
    }
}

/// Coalesces the stream's sub-agent and deep-search tool parts by call id.
///
/// Calls keep the order in which they were first observed. A call with no
/// terminal signal is `running` while its turn is still streaming and
/// `failed` once it is not.
pub fn aggregate(stream: &StreamState, clock: &mut FallbackClock) -> ToolEvents {
    let mut folds: Vec<CallFold> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for turn in &stream.turns {
        for part in turn.tool_parts() {
            let Some(family) = ToolFamily::from_tool_name(&part.tool_name) else {
                continue;
            };
            if family == ToolFamily::GraphMutation {
                continue;
            }
            let slot = *index.entry(part.tool_call_id.clone()).or_insert_with(|| {
                folds.push(CallFold::new(family, part, &turn.id));
                folds.len() - 1
            });
            folds[slot].absorb(part);
        }
    }

    let active_turn = stream.active_turn_id();
    let mut events = ToolEvents::default();
    for fold in folds {
        let family = fold.family;
        let message = fold.into_message(active_turn, clock);
        match family {
            ToolFamily::Subagent => events.subagent.push(message),
            ToolFamily::DeepSearch => events.deep_search.push(message),
            ToolFamily::GraphMutation => {}
        }
    }
    events
}

/// Inserts `event` or replaces the row that already has its id.
pub fn upsert_event(events: &mut Vec<Message>, event: Message) {
    match events.iter_mut().find(|existing| existing.id == event.id) {
        Some(existing) => *existing = event,
        None => events.push(event),
    }
}
