//! Remote collaborators and their request/response shapes.
//!
//! The proposal, validation and persistence services are black boxes; the
//! engine only depends on the traits below. Requests serialize to the
//! camelCase JSON the services expect.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::graph::GraphSnapshot;
use super::persistence::{ChatSummary, ProjectSnapshot};

/// Opaque per-request settings forwarded to remote services.
pub type ServiceSettings = BTreeMap<String, Value>;

// ============================================================================
// Graph proposal
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalRequest {
    pub project_path: PathBuf,
    pub response_id: String,
    pub response_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_node_summary: Option<String>,
    pub graph: GraphSnapshot,
    #[serde(default)]
    pub settings: ServiceSettings,
}

/// One proposed insight node.
///
/// `parent_id` names an existing node (by id or snapshot number) or another
/// proposal of the same batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(deserialize_with = "string_or_number")]
    pub parent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposalResponse {
    #[serde(default)]
    pub nodes: Vec<Proposal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// Parent references may arrive as snapshot numbers rather than strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a node reference, found {other}"
        ))),
    }
}

#[async_trait]
pub trait ProposalService: Send + Sync {
    async fn propose(&self, request: ProposalRequest) -> Result<ProposalResponse>;
}

// ============================================================================
// Deep search / validation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRequest {
    pub project_path: PathBuf,
    pub query: String,
    pub answer: String,
    #[serde(default)]
    pub settings: ServiceSettings,
    #[serde(default)]
    pub deep_research: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Complete,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub status: ValidationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<Vec<Value>>,
}

#[async_trait]
pub trait ValidationService: Send + Sync {
    async fn validate(&self, request: ValidationRequest) -> Result<ValidationResponse>;
}

// ============================================================================
// Persistence
// ============================================================================

#[async_trait]
pub trait PersistenceService: Send + Sync {
    /// Reads the stored snapshot of a chat, if one exists.
    async fn load(&self, project: &Path, chat: &str) -> Result<Option<ProjectSnapshot>>;

    async fn save(
        &self,
        project: &Path,
        chat: &str,
        snapshot: &ProjectSnapshot,
    ) -> Result<ChatSummary>;
}

// ============================================================================
// Viewport
// ============================================================================

/// Canvas camera. Centering is best-effort.
pub trait Viewport: Send + Sync {
    fn center_on(&self, node_id: &str) -> Result<()>;
}

/// Viewport for headless runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoViewport;

impl Viewport for NoViewport {
    fn center_on(&self, _node_id: &str) -> Result<()> {
        Ok(())
    }
}
