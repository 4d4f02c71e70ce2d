//! Raw per-turn records as delivered by the conversation stream.
//!
//! The stream re-delivers the full turn list on every update; a turn that is
//! still being generated grows new parts between deliveries.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::{MessageStatus, Role};

/// Overall status of the conversation stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    #[default]
    Idle,
    Submitted,
    Streaming,
    Error,
}

impl StreamStatus {
    /// True while the latest assistant turn may still change.
    pub fn is_active(self) -> bool {
        matches!(self, StreamStatus::Submitted | StreamStatus::Streaming)
    }
}

/// Snapshot of the stream handed to the timeline on every update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamState {
    #[serde(default)]
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub status: StreamStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamState {
    /// Id of the assistant turn still being generated, if any.
    pub fn active_turn_id(&self) -> Option<&str> {
        if !self.status.is_active() {
            return None;
        }
        self.latest_assistant().map(|turn| turn.id.as_str())
    }

    /// The trailing turn when it is an assistant turn. Once a user turn
    /// follows, no assistant turn is latest.
    pub fn latest_assistant(&self) -> Option<&Turn> {
        self.turns.last().filter(|turn| turn.role == Role::Assistant)
    }
}

/// One model- or user-produced conversational unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<TurnPart>,
    #[serde(default)]
    pub metadata: TurnMetadata,
}

impl Turn {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            parts: Vec::new(),
            metadata: TurnMetadata::default(),
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.parts.push(TurnPart::Text { text: text.into() });
        self
    }

    #[must_use]
    pub fn with_tool(mut self, part: ToolPart) -> Self {
        self.parts.push(TurnPart::Tool(part));
        self
    }

    pub fn tool_parts(&self) -> impl Iterator<Item = &ToolPart> {
        self.parts.iter().filter_map(|part| match part {
            TurnPart::Tool(tool) => Some(tool),
            _ => None,
        })
    }

    /// Concatenation of the plain text parts.
    pub fn plain_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                TurnPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Out-of-band data attached to a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Explicit final answer; preferred over any text derived from parts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    /// Terminal status carried over from a previous session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured piece of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TurnPart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    Tool(ToolPart),
    /// Any part type this engine does not interpret.
    #[serde(other)]
    Unknown,
}

/// Delivery state of one tool-call part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ToolPartState {
    #[default]
    InputStreaming,
    InputAvailable,
    OutputAvailable,
    OutputError,
}

/// A (possibly partial) delivery of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPart {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub state: ToolPartState,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

impl ToolPart {
    pub fn new(tool_call_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            state: ToolPartState::InputAvailable,
            input: Value::Null,
            output: None,
            error_text: None,
        }
    }

    #[must_use]
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: Value) -> Self {
        self.state = ToolPartState::OutputAvailable;
        self.output = Some(output);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.state = ToolPartState::OutputError;
        self.error_text = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn unknown_parts_are_tolerated() {
        let turn: Turn = serde_json::from_value(json!({
            "id": "t1",
            "role": "assistant",
            "parts": [
                {"type": "step-start"},
                {"type": "text", "text": "Hello "},
                {"type": "tool", "toolCallId": "c1", "toolName": "deep_search", "state": "input-streaming"},
                {"type": "text", "text": "world"}
            ]
        }))
        .unwrap();

        assert_eq!(turn.parts[0], TurnPart::Unknown);
        assert_eq!(turn.plain_text(), "Hello world");
        assert_eq!(turn.tool_parts().count(), 1);
    }

    #[test]
    fn active_turn_is_trailing_assistant_while_streaming() {
        let mut state = StreamState {
            turns: vec![
                Turn::new("u1", Role::User),
                Turn::new("a1", Role::Assistant),
            ],
            status: StreamStatus::Streaming,
            error: None,
        };
        assert_eq!(state.active_turn_id(), Some("a1"));

        state.status = StreamStatus::Idle;
        assert_eq!(state.active_turn_id(), None);
    }

    #[test]
    fn follow_up_question_leaves_no_active_turn() {
        let state = StreamState {
            turns: vec![
                Turn::new("u1", Role::User),
                Turn::new("a1", Role::Assistant),
                Turn::new("u2", Role::User),
            ],
            status: StreamStatus::Submitted,
            error: None,
        };
        assert!(state.latest_assistant().is_none());
        assert_eq!(state.active_turn_id(), None);
    }
}
