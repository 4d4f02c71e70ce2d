//! Tool payload decoding.
//!
//! Tool outputs arrive as loose JSON. Each family gets one closed shape here;
//! anything that does not parse into it is rejected at ingress instead of
//! being carried into the transcript.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::message::{MessageKind, ToolStatus};

/// Tool names recognized as graph mutations.
pub const GRAPH_TOOL_NAMES: &[&str] = &["grow_graph", "graph_mutation", "propose_nodes"];
/// Tool names recognized as parallel sub-agent research.
pub const SUBAGENT_TOOL_NAMES: &[&str] = &["subagents", "run_subagents", "parallel_research"];
/// Tool names recognized as deep search / validation.
pub const DEEP_SEARCH_TOOL_NAMES: &[&str] = &["deep_search", "web_validate", "validate_answer"];

/// The three tool families this engine reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolFamily {
    GraphMutation,
    Subagent,
    DeepSearch,
}

impl ToolFamily {
    pub fn from_tool_name(name: &str) -> Option<Self> {
        let name = name.trim().strip_prefix("tool-").unwrap_or(name.trim());
        if GRAPH_TOOL_NAMES.contains(&name) {
            Some(ToolFamily::GraphMutation)
        } else if SUBAGENT_TOOL_NAMES.contains(&name) {
            Some(ToolFamily::Subagent)
        } else if DEEP_SEARCH_TOOL_NAMES.contains(&name) {
            Some(ToolFamily::DeepSearch)
        } else {
            None
        }
    }

    pub fn kind(self) -> MessageKind {
        match self {
            ToolFamily::GraphMutation => MessageKind::GraphEvent,
            ToolFamily::Subagent => MessageKind::SubagentEvent,
            ToolFamily::DeepSearch => MessageKind::DeepsearchEvent,
        }
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("{family:?} payload must be a JSON object")]
    NotAnObject { family: ToolFamily },
    #[error("{family:?} payload has an unrecognized shape: {source}")]
    Shape {
        family: ToolFamily,
        #[source]
        source: serde_json::Error,
    },
    #[error("graph mutation payloads are not derived from stream parts")]
    NotDerived,
}

/// A decoded tool output.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolPayload {
    Subagent(SubagentPayload),
    DeepSearch(DeepSearchPayload),
}

impl ToolPayload {
    /// Parses and validates a raw output for `family`.
    pub fn decode(family: ToolFamily, raw: &Value) -> Result<Self, PayloadError> {
        if !raw.is_object() {
            return Err(PayloadError::NotAnObject { family });
        }
        match family {
            ToolFamily::GraphMutation => Err(PayloadError::NotDerived),
            ToolFamily::Subagent => SubagentPayload::deserialize(raw)
                .map(ToolPayload::Subagent)
                .map_err(|source| PayloadError::Shape { family, source }),
            ToolFamily::DeepSearch => DeepSearchPayload::deserialize(raw)
                .map(ToolPayload::DeepSearch)
                .map_err(|source| PayloadError::Shape { family, source }),
        }
    }

    /// Answer-like text carried by the payload, if any.
    pub fn answer(&self) -> Option<&str> {
        match self {
            ToolPayload::Subagent(payload) => payload.answer(),
            ToolPayload::DeepSearch(payload) => non_empty(payload.conclusion.as_deref()),
        }
    }
}

// ============================================================================
// Sub-agent research
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentPayload {
    #[serde(default)]
    pub messages: Vec<SubagentMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubagentMessage {
    #[serde(default)]
    pub parts: Vec<SubagentPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SubagentPart {
    Execution {
        status: ExecutionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Complete,
    Failed,
    #[serde(other)]
    Unknown,
}

impl SubagentPayload {
    /// Status derived from the execution parts of the last nested message.
    ///
    /// Failure dominates, then running, then complete. `None` when the last
    /// message carries no resolved execution.
    pub fn status(&self) -> Option<ToolStatus> {
        let last = self.messages.last()?;
        let statuses: Vec<ExecutionStatus> = last
            .parts
            .iter()
            .filter_map(|part| match part {
                SubagentPart::Execution { status, .. } => Some(*status),
                SubagentPart::Other => None,
            })
            .collect();

        if statuses.contains(&ExecutionStatus::Failed) {
            Some(ToolStatus::Failed)
        } else if statuses.contains(&ExecutionStatus::Running) {
            Some(ToolStatus::Running)
        } else if statuses.contains(&ExecutionStatus::Complete) {
            Some(ToolStatus::Complete)
        } else {
            None
        }
    }

    pub fn answer(&self) -> Option<&str> {
        non_empty(self.answer.as_deref()).or_else(|| non_empty(self.conclusion.as_deref()))
    }
}

// ============================================================================
// Deep search / validation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStatus {
    Running,
    Complete,
    Failed,
    Skipped,
}

impl SearchStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SearchStatus::Running)
    }
}

/// Current state of a deep search, folded from its partial deliveries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeepSearchPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SearchStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeepSearchPayload {
    /// Folds a later delivery over this one, field by field.
    ///
    /// Present fields of `later` win, except that a terminal status is never
    /// replaced by `running`.
    pub fn fold(&mut self, later: DeepSearchPayload) {
        match (self.status, later.status) {
            (Some(current), Some(SearchStatus::Running)) if current.is_terminal() => {}
            (_, Some(next)) => self.status = Some(next),
            (_, None) => {}
        }
        if later.done.is_some() {
            self.done = later.done;
        }
        if later.query.is_some() {
            self.query = later.query;
        }
        if later.conclusion.is_some() {
            self.conclusion = later.conclusion;
        }
        if later.sources.is_some() {
            self.sources = later.sources;
        }
        if later.references.is_some() {
            self.references = later.references;
        }
        if later.error.is_some() {
            self.error = later.error;
        }
    }

    /// Whether the search has finished, explicitly or by evidence.
    pub fn is_done(&self) -> bool {
        self.done == Some(true)
            || self.status.is_some_and(SearchStatus::is_terminal)
            || non_empty(self.conclusion.as_deref()).is_some()
            || self.sources.as_ref().is_some_and(|s| !s.is_empty())
            || self.references.as_ref().is_some_and(|r| !r.is_empty())
    }

    pub fn derived_status(&self) -> Option<ToolStatus> {
        match self.status {
            Some(SearchStatus::Failed) => Some(ToolStatus::Failed),
            Some(SearchStatus::Complete | SearchStatus::Skipped) => Some(ToolStatus::Complete),
            _ if self.is_done() => Some(ToolStatus::Complete),
            _ => None,
        }
    }

    /// One-line summary for the transcript row.
    pub fn summary(&self) -> String {
        non_empty(self.conclusion.as_deref())
            .or_else(|| non_empty(self.query.as_deref()))
            .unwrap_or_default()
            .to_string()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
