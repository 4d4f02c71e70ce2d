//! Running-job registry.
//!
//! Tracks in-flight work per `(project, chat)`. Several independent jobs
//! (stream, graph growth, validation) may be running for one chat at once,
//! so each key holds a multiset of job ids. Nothing here is persisted.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

type JobKey = (PathBuf, String);

/// Registry change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Started {
        project: PathBuf,
        chat: String,
        job_id: String,
    },
    Finished {
        project: PathBuf,
        chat: String,
        job_id: String,
    },
}

impl JobEvent {
    pub fn project(&self) -> &Path {
        match self {
            Self::Started { project, .. } | Self::Finished { project, .. } => project,
        }
    }
}

/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<JobKey, Vec<String>>>>,
    events: broadcast::Sender<JobEvent>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobKey, Vec<String>>> {
        self.jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn start(&self, project: &Path, chat: &str, job_id: &str) {
        self.lock()
            .entry((project.to_path_buf(), chat.to_string()))
            .or_default()
            .push(job_id.to_string());
        let _ = self.events.send(JobEvent::Started {
            project: project.to_path_buf(),
            chat: chat.to_string(),
            job_id: job_id.to_string(),
        });
    }

    /// Clears one occurrence of `job_id`. Returns false if it was not running.
    pub fn finish(&self, project: &Path, chat: &str, job_id: &str) -> bool {
        let removed = {
            let mut jobs = self.lock();
            let key = (project.to_path_buf(), chat.to_string());
            let Some(running) = jobs.get_mut(&key) else {
                return false;
            };
            let removed = running
                .iter()
                .position(|id| id == job_id)
                .map(|index| running.remove(index))
                .is_some();
            if running.is_empty() {
                jobs.remove(&key);
            }
            removed
        };
        if removed {
            let _ = self.events.send(JobEvent::Finished {
                project: project.to_path_buf(),
                chat: chat.to_string(),
                job_id: job_id.to_string(),
            });
        }
        removed
    }

    /// Chats of `project` with at least one job in flight, sorted.
    pub fn list_running(&self, project: &Path) -> Vec<String> {
        let chats: BTreeSet<String> = self
            .lock()
            .iter()
            .filter(|((path, _), running)| path == project && !running.is_empty())
            .map(|((_, chat), _)| chat.clone())
            .collect();
        chats.into_iter().collect()
    }

    pub fn is_busy(&self, project: &Path, chat: &str) -> bool {
        self.lock()
            .get(&(project.to_path_buf(), chat.to_string()))
            .is_some_and(|running| !running.is_empty())
    }

    pub fn running_jobs(&self, project: &Path, chat: &str) -> Vec<String> {
        self.lock()
            .get(&(project.to_path_buf(), chat.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}
