//! Project snapshots on disk.
//!
//! One JSON file per chat under `<project>/.strata/chats/<chatId>.json`.
//! Writes go through a temp file and a rename so a crash never leaves a
//! half-written snapshot. `Debouncer` coalesces bursts of saves into one
//! write of the latest snapshot.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::graph::{Edge, GraphNode};
use super::message::{Message, MessageKind, Role, format_timestamp};
use super::services::PersistenceService;

pub const SNAPSHOT_VERSION: u32 = 1;

const STATE_DIR: &str = ".strata";
const CHATS_DIR: &str = "chats";
const MAX_TITLE_CHARS: usize = 64;

/// Everything stored for one chat of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSnapshot {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub chat: Vec<Message>,
    #[serde(default)]
    pub auto_layout_locked: bool,
    #[serde(default)]
    pub browser_validation_by_url: BTreeMap<String, Value>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

impl Default for ProjectSnapshot {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            chat: Vec::new(),
            auto_layout_locked: false,
            browser_validation_by_url: BTreeMap::new(),
            version: SNAPSHOT_VERSION,
        }
    }
}

impl ProjectSnapshot {
    /// Persisted text rows (the turn history).
    pub fn text_messages(&self) -> impl Iterator<Item = &Message> {
        self.chat.iter().filter(|m| m.kind == MessageKind::Text)
    }

    /// Persisted tool-event rows.
    pub fn tool_events(&self) -> impl Iterator<Item = &Message> {
        self.chat.iter().filter(|m| m.kind.is_tool_event())
    }

    /// Chat title: the first line of the first user message.
    pub fn title(&self) -> Option<String> {
        let first = self
            .text_messages()
            .find(|m| m.role == Role::User && !m.content.trim().is_empty())?;
        let line = first.content.trim().lines().next().unwrap_or_default();
        if line.chars().count() <= MAX_TITLE_CHARS {
            return Some(line.to_string());
        }
        let truncated: String = line.chars().take(MAX_TITLE_CHARS).collect();
        Some(format!("{}…", truncated.trim_end()))
    }
}

/// Metadata returned after a save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub message_count: usize,
    pub updated_at: String,
}

// ============================================================================
// File store
// ============================================================================

/// Stores snapshots as JSON files inside the project directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStore;

impl FileStore {
    pub fn chats_dir(project: &Path) -> PathBuf {
        project.join(STATE_DIR).join(CHATS_DIR)
    }

    pub fn chat_path(project: &Path, chat: &str) -> Result<PathBuf> {
        if chat.is_empty()
            || chat.starts_with('.')
            || chat.contains(['/', '\\'])
        {
            bail!("Invalid chat id '{chat}'");
        }
        Ok(Self::chats_dir(project).join(format!("{chat}.json")))
    }

    pub fn read(project: &Path, chat: &str) -> Result<Option<ProjectSnapshot>> {
        let path = Self::chat_path(project, chat)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read chat snapshot {}", path.display()))?;
        let snapshot = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse chat snapshot {}", path.display()))?;
        Ok(Some(snapshot))
    }

    pub fn write(project: &Path, chat: &str, snapshot: &ProjectSnapshot) -> Result<ChatSummary> {
        let path = Self::chat_path(project, chat)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let content =
            serde_json::to_string_pretty(snapshot).context("Failed to serialize chat snapshot")?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write chat snapshot to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        debug!(path = %path.display(), messages = snapshot.chat.len(), "Saved chat snapshot");
        Ok(ChatSummary {
            chat_id: chat.to_string(),
            title: snapshot.title(),
            message_count: snapshot.chat.len(),
            updated_at: format_timestamp(Utc::now()),
        })
    }
}

#[async_trait]
impl PersistenceService for FileStore {
    async fn load(&self, project: &Path, chat: &str) -> Result<Option<ProjectSnapshot>> {
        Self::read(project, chat)
    }

    async fn save(
        &self,
        project: &Path,
        chat: &str,
        snapshot: &ProjectSnapshot,
    ) -> Result<ChatSummary> {
        Self::write(project, chat, snapshot)
    }
}

// ============================================================================
// Debounced writer
// ============================================================================

struct PendingSave {
    project: PathBuf,
    chat: String,
    snapshot: ProjectSnapshot,
}

/// Coalesces saves: each `schedule` restarts the delay, and only the last
/// scheduled snapshot is written once the delay passes quietly.
pub struct Debouncer {
    store: Arc<dyn PersistenceService>,
    delay: Duration,
    generation: Arc<AtomicU64>,
    pending: Arc<Mutex<Option<PendingSave>>>,
}

impl Debouncer {
    pub fn new(store: Arc<dyn PersistenceService>, delay: Duration) -> Self {
        Self {
            store,
            delay,
            generation: Arc::new(AtomicU64::new(0)),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    pub fn schedule(&self, project: &Path, chat: &str, snapshot: ProjectSnapshot) -> JoinHandle<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock_pending(&self.pending) = Some(PendingSave {
            project: project.to_path_buf(),
            chat: chat.to_string(),
            snapshot,
        });

        let store = Arc::clone(&self.store);
        let current = Arc::clone(&self.generation);
        let pending = Arc::clone(&self.pending);
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            let Some(save) = lock_pending(&pending).take() else {
                return;
            };
            if let Err(err) = store.save(&save.project, &save.chat, &save.snapshot).await {
                warn!(chat = %save.chat, "Failed to persist chat snapshot: {err:#}");
            }
        })
    }

    /// Writes the pending snapshot now, if any.
    pub async fn flush(&self) -> Result<Option<ChatSummary>> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let Some(save) = lock_pending(&self.pending).take() else {
            return Ok(None);
        };
        let summary = self
            .store
            .save(&save.project, &save.chat, &save.snapshot)
            .await?;
        Ok(Some(summary))
    }

    pub fn has_pending(&self) -> bool {
        lock_pending(&self.pending).is_some()
    }
}

fn lock_pending(
    pending: &Mutex<Option<PendingSave>>,
) -> std::sync::MutexGuard<'_, Option<PendingSave>> {
    pending
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
