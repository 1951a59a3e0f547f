//! File-backed queue of deferred workflow runs.
//!
//! The whole queue lives in one JSON array that is rewritten on every
//! mutation. Writers inside one process are serialized by a mutex; nothing
//! coordinates separate processes, so the queue suits low-volume local use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use strand_core::error::{Result, StrandError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the item has reached a final state.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = StrandError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StrandError::Queue(format!("unknown status: {}", other))),
        }
    }
}

/// One deferred run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub run_id: String,
    pub workflow_id: String,
    pub query: String,
    pub sequence_name: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "default_status")]
    pub status: QueueStatus,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
}

fn default_status() -> QueueStatus {
    QueueStatus::Queued
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_workflow: BTreeMap<String, usize>,
}

pub struct JsonQueue {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonQueue {
    /// Open the queue at `path`, creating parent directories and an empty file if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let queue = Self {
            path,
            lock: Mutex::new(()),
        };
        if !queue.path.exists() {
            queue.save(&[])?;
        }
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unreadable file reads as an empty queue.
    fn load(&self) -> Vec<QueueItem> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read queue, starting empty");
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(items) => items,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to parse queue, starting empty");
                Vec::new()
            }
        }
    }

    fn save(&self, items: &[QueueItem]) -> Result<()> {
        let json = serde_json::to_string_pretty(items)?;
        std::fs::write(&self.path, json)
            .map_err(|e| StrandError::Queue(format!("failed to write {}: {}", self.path.display(), e)))?;
        debug!(items = items.len(), "Saved queue");
        Ok(())
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|e| StrandError::Queue(e.to_string()))
    }

    /// Append a run and return its new run id.
    pub fn submit(
        &self,
        workflow_id: &str,
        query: &str,
        sequence_name: &str,
        user_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<String> {
        let _guard = self.guard()?;
        let run_id = Uuid::new_v4().to_string();

        let mut items = self.load();
        items.push(QueueItem {
            run_id: run_id.clone(),
            workflow_id: workflow_id.to_string(),
            query: query.to_string(),
            sequence_name: sequence_name.to_string(),
            user_id: user_id.map(String::from),
            session_id: session_id.map(String::from),
            status: QueueStatus::Queued,
            created_at: Utc::now().to_rfc3339(),
            updated_at: None,
        });
        self.save(&items)?;

        info!(run_id = %run_id, workflow_id, "Submitted run to queue");
        Ok(run_id)
    }

    /// The oldest queued item for `workflow_id`. Does not change its status.
    pub fn get_next_queued(&self, workflow_id: &str) -> Result<Option<QueueItem>> {
        let _guard = self.guard()?;
        Ok(self
            .load()
            .into_iter()
            .find(|item| item.workflow_id == workflow_id && item.status == QueueStatus::Queued))
    }

    /// Set an item's status. Returns false if no item has that run id.
    pub fn update_status(&self, run_id: &str, status: QueueStatus) -> Result<bool> {
        let _guard = self.guard()?;
        let mut items = self.load();

        let Some(item) = items.iter_mut().find(|item| item.run_id == run_id) else {
            warn!(run_id, "Run not found in queue");
            return Ok(false);
        };
        item.status = status;
        item.updated_at = Some(Utc::now().to_rfc3339());
        self.save(&items)?;

        debug!(run_id, status = %status, "Updated queue item");
        Ok(true)
    }

    pub fn get_all_queued(&self) -> Result<Vec<QueueItem>> {
        self.get_by_status(QueueStatus::Queued)
    }

    pub fn get_by_status(&self, status: QueueStatus) -> Result<Vec<QueueItem>> {
        let _guard = self.guard()?;
        Ok(self
            .load()
            .into_iter()
            .filter(|item| item.status == status)
            .collect())
    }

    /// Every item, in submission order.
    pub fn items(&self) -> Result<Vec<QueueItem>> {
        let _guard = self.guard()?;
        Ok(self.load())
    }

    /// Drop completed and failed items. Returns how many were removed.
    pub fn clear_completed(&self) -> Result<usize> {
        let _guard = self.guard()?;
        let items = self.load();
        let before = items.len();

        let kept: Vec<QueueItem> = items
            .into_iter()
            .filter(|item| !item.status.is_finished())
            .collect();
        self.save(&kept)?;

        let removed = before - kept.len();
        if removed > 0 {
            info!(removed, "Cleared finished items from queue");
        }
        Ok(removed)
    }

    pub fn get_stats(&self) -> Result<QueueStats> {
        let _guard = self.guard()?;
        let items = self.load();

        let mut stats = QueueStats {
            total: items.len(),
            ..Default::default()
        };
        for item in &items {
            *stats.by_status.entry(item.status.to_string()).or_default() += 1;
            *stats.by_workflow.entry(item.workflow_id.clone()).or_default() += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (tempfile::TempDir, JsonQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = JsonQueue::open(dir.path().join("q").join("workflow_queue.json")).unwrap();
        (dir, queue)
    }

    #[test]
    fn test_open_creates_empty_file() {
        let (_dir, queue) = queue();
        assert!(queue.path().exists());
        assert_eq!(std::fs::read_to_string(queue.path()).unwrap().trim(), "[]");
    }

    #[test]
    fn test_next_queued_is_fifo_per_workflow() {
        let (_dir, queue) = queue();
        let first = queue.submit("wf1", "one", "main", None, None).unwrap();
        queue.submit("wf2", "other", "main", None, None).unwrap();
        let second = queue.submit("wf1", "two", "main", Some("u1"), Some("s1")).unwrap();

        let next = queue.get_next_queued("wf1").unwrap().unwrap();
        assert_eq!(next.run_id, first);
        assert_eq!(next.status, QueueStatus::Queued);

        assert!(queue.update_status(&first, QueueStatus::Running).unwrap());
        let next = queue.get_next_queued("wf1").unwrap().unwrap();
        assert_eq!(next.run_id, second);
        assert_eq!(next.user_id.as_deref(), Some("u1"));
        assert_eq!(next.session_id.as_deref(), Some("s1"));

        assert!(queue.get_next_queued("wf3").unwrap().is_none());
    }

    #[test]
    fn test_update_unknown_run() {
        let (_dir, queue) = queue();
        assert!(!queue.update_status("nope", QueueStatus::Failed).unwrap());
    }

    #[test]
    fn test_clear_completed_and_stats() {
        let (_dir, queue) = queue();
        let a = queue.submit("wf1", "a", "main", None, None).unwrap();
        let b = queue.submit("wf1", "b", "main", None, None).unwrap();
        queue.submit("wf2", "c", "main", None, None).unwrap();
        queue.update_status(&a, QueueStatus::Completed).unwrap();
        queue.update_status(&b, QueueStatus::Failed).unwrap();

        let stats = queue.get_stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status.get("completed"), Some(&1));
        assert_eq!(stats.by_status.get("failed"), Some(&1));
        assert_eq!(stats.by_workflow.get("wf1"), Some(&2));

        assert_eq!(queue.clear_completed().unwrap(), 2);
        assert_eq!(queue.get_all_queued().unwrap().len(), 1);
        assert_eq!(queue.get_stats().unwrap().total, 1);
    }

    #[test]
    fn test_corrupt_file_reads_empty() {
        let (_dir, queue) = queue();
        std::fs::write(queue.path(), "{not json").unwrap();
        assert!(queue.get_all_queued().unwrap().is_empty());
        queue.submit("wf1", "q", "main", None, None).unwrap();
        assert_eq!(queue.get_all_queued().unwrap().len(), 1);
    }

    #[test]
    fn test_status_wire_format() {
        let (_dir, queue) = queue();
        queue.submit("wf1", "q", "main", None, None).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(queue.path()).unwrap()).unwrap();
        assert_eq!(raw[0]["status"], "queued");
        assert_eq!("running".parse::<QueueStatus>().unwrap(), QueueStatus::Running);
        assert!("paused".parse::<QueueStatus>().is_err());
    }
}
