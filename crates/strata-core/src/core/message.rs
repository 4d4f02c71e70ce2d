//! Transcript message records.
//!
//! A `Message` is one row of the reconciled transcript. Plain text turns and
//! the three tool-event families share the same record; the tool families
//! fill in the `tool_*` fields and carry a kind-prefixed id so that ids never
//! collide across kinds.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Author of a transcript row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[default]
    Assistant,
    System,
}

/// Lifecycle of an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Complete,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Complete | MessageStatus::Failed)
    }
}

/// Lifecycle of a tool event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Running,
    Complete,
    Failed,
}

impl ToolStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ToolStatus::Complete | ToolStatus::Failed)
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolStatus::Running => write!(f, "running"),
            ToolStatus::Complete => write!(f, "complete"),
            ToolStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What a transcript row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    #[default]
    Text,
    GraphEvent,
    SubagentEvent,
    DeepsearchEvent,
}

impl MessageKind {
    /// Tool kinds in the order the reconciler folds them into the transcript.
    pub const TOOL_KINDS: [MessageKind; 3] = [
        MessageKind::GraphEvent,
        MessageKind::SubagentEvent,
        MessageKind::DeepsearchEvent,
    ];

    /// Id prefix for events of this kind. `None` for plain text.
    pub fn id_prefix(self) -> Option<&'static str> {
        match self {
            MessageKind::Text => None,
            MessageKind::GraphEvent => Some("graph"),
            MessageKind::SubagentEvent => Some("subagent"),
            MessageKind::DeepsearchEvent => Some("deepsearch"),
        }
    }

    /// Builds the stable transcript id for a tool call of this kind.
    pub fn event_id(self, tool_call_id: &str) -> String {
        match self.id_prefix() {
            Some(prefix) => format!("{prefix}-{tool_call_id}"),
            None => tool_call_id.to_string(),
        }
    }

    pub fn is_tool_event(self) -> bool {
        !matches!(self, MessageKind::Text)
    }
}

/// Input attached to a tool event.
///
/// `response_id` links the event to the turn that produced it; everything
/// else from the originating call is kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ToolInput {
    pub fn new(response_id: Option<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            response_id,
            tool_call_id: Some(tool_call_id.into()),
            extra: Map::new(),
        }
    }

    /// Copies the object fields of `value` into `extra`, never overriding the
    /// identity fields.
    #[must_use]
    pub fn with_fields(mut self, value: &Value) -> Self {
        if let Value::Object(fields) = value {
            for (key, field) in fields {
                if key == "responseId" || key == "toolCallId" {
                    continue;
                }
                self.extra.insert(key.clone(), field.clone());
            }
        }
        self
    }
}

/// One transcript row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// RFC 3339 timestamp. Kept as text: persisted rows may carry values that
    /// do not parse, and those must survive a round trip untouched.
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<ToolInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_status: Option<ToolStatus>,
}

impl Message {
    /// Creates a plain text row.
    pub fn text(
        id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            created_at: format_timestamp(created_at),
            status: None,
            error: None,
            kind: MessageKind::Text,
            tool_name: None,
            tool_input: None,
            tool_output: None,
            tool_status: None,
        }
    }

    /// Creates a tool event row with the kind-prefixed id for `tool_call_id`.
    pub fn tool_event(
        kind: MessageKind,
        tool_name: impl Into<String>,
        input: ToolInput,
        status: ToolStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        let call_id = input.tool_call_id.clone().unwrap_or_default();
        Self {
            id: kind.event_id(&call_id),
            role: Role::Assistant,
            content: String::new(),
            created_at: format_timestamp(created_at),
            status: None,
            error: None,
            kind,
            tool_name: Some(tool_name.into()),
            tool_input: Some(input),
            tool_output: None,
            tool_status: Some(status),
        }
    }

    /// Turn id this row belongs to, if any.
    pub fn response_id(&self) -> Option<&str> {
        self.tool_input
            .as_ref()
            .and_then(|input| input.response_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    pub fn tool_call_id(&self) -> Option<&str> {
        self.tool_input
            .as_ref()
            .and_then(|input| input.tool_call_id.as_deref())
    }

    /// Parsed `created_at`, or `None` when it is missing or malformed.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.created_at)
    }

    /// Marks a tool event as finished.
    pub fn finish_tool(&mut self, status: ToolStatus, output: Option<Value>, error: Option<String>) {
        self.tool_status = Some(status);
        if output.is_some() {
            self.tool_output = output;
        }
        self.error = error;
    }
}

/// Formats a timestamp the way every transcript row stores it.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn event_ids_are_namespaced_by_kind() {
        assert_eq!(MessageKind::GraphEvent.event_id("c1"), "graph-c1");
        assert_eq!(MessageKind::SubagentEvent.event_id("c1"), "subagent-c1");
        assert_eq!(MessageKind::DeepsearchEvent.event_id("c1"), "deepsearch-c1");
        assert_eq!(MessageKind::Text.event_id("c1"), "c1");
    }

    #[test]
    fn message_serializes_camel_case_with_kebab_kind() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let message = Message::tool_event(
            MessageKind::DeepsearchEvent,
            "deep_search",
            ToolInput::new(Some("t1".into()), "c9"),
            ToolStatus::Running,
            ts,
        );

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["id"], "deepsearch-c9");
        assert_eq!(value["kind"], "deepsearch-event");
        assert_eq!(value["toolStatus"], "running");
        assert_eq!(value["toolInput"]["responseId"], "t1");
        assert_eq!(value["createdAt"], "2025-01-02T03:04:05.000Z");
    }

    #[test]
    fn unparseable_created_at_survives_round_trip() {
        let raw = json!({
            "id": "m1",
            "role": "user",
            "content": "hi",
            "createdAt": "yesterday-ish"
        });
        let message: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(message.kind, MessageKind::Text);
        assert_eq!(message.timestamp(), None);
        assert_eq!(
            serde_json::to_value(&message).unwrap()["createdAt"],
            "yesterday-ish"
        );
    }

    #[test]
    fn tool_input_keeps_identity_fields() {
        let input = ToolInput::new(Some("t1".into()), "c1")
            .with_fields(&json!({"query": "q", "responseId": "spoofed"}));
        assert_eq!(input.response_id.as_deref(), Some("t1"));
        assert_eq!(input.extra.get("query"), Some(&json!("q")));
        assert!(!input.extra.contains_key("responseId"));
    }
}
