use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use strand_core::event::{EventBus, WorkflowEvent};

/// JSONL run logger.
///
/// Subscribes to the EventBus and writes structured log entries as JSONL
/// (one JSON object per line). This format is append-only and crash-resilient:
/// even if the process dies mid-run, all previously written lines are intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
    run_id: Option<String>,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    session_id: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// Create a new RunLogger.
    ///
    /// `log_dir` is the base directory; logs are written to
    /// `{log_dir}/{session_id}/{timestamp}_{run_id}.jsonl`, or
    /// `{timestamp}.jsonl` when not bound to one run.
    /// `level` controls verbosity: 1=workflow events, 2=plus task results, 3=everything.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self {
            log_dir,
            level,
            run_id: None,
        }
    }

    /// Only log events of one run; others on the bus are ignored.
    pub fn for_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Run the logger as a background task.
    ///
    /// Subscribes immediately, then writes JSONL until a WorkflowCompleted/
    /// WorkflowError event, or until cancelled once no events are pending. The future resolves to the path
    /// of the log file, if one was opened.
    pub fn run(
        self,
        event_bus: Arc<EventBus>,
        session_id: String,
        cancel: CancellationToken,
    ) -> impl Future<Output = Option<PathBuf>> + Send {
        let rx = event_bus.subscribe();
        self.write_events(rx, session_id, cancel)
    }

    async fn write_events(
        self,
        mut rx: broadcast::Receiver<WorkflowEvent>,
        session_id: String,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let session_dir = self.log_dir.join(&session_id);
        if let Err(e) = tokio::fs::create_dir_all(&session_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S%.3f").to_string();
        let file_name = match &self.run_id {
            Some(run_id) => format!("{}_{}.jsonl", timestamp, run_id),
            None => format!("{}.jsonl", timestamp),
        };
        let log_path = session_dir.join(file_name);

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return None;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            // Buffered events win over cancellation so a finished run is logged in full.
            tokio::select! {
                biased;
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if self.run_id.as_deref().is_some_and(|id| id != event.run_id()) {
                                continue;
                            }
                            if let Some(entry) = self.event_to_entry(&session_id, &event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    // Flush after each entry for crash resilience
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }

                            if event.is_terminal() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
        Some(log_path)
    }

    /// Convert a WorkflowEvent to a log entry (None if filtered by level).
    fn event_to_entry(&self, session_id: &str, event: &WorkflowEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, task: Option<&str>, detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            session_id: session_id.to_string(),
            run_id: event.run_id().to_string(),
            event_type: event_type.to_string(),
            task: task.map(String::from),
            detail,
        };

        match event {
            // L1: run boundaries
            WorkflowEvent::WorkflowStarted(e) => Some(entry(
                "workflow_started",
                None,
                Some(serde_json::json!({
                    "workflow": e.workflow_name,
                    "sequence": e.sequence_name,
                })),
            )),
            WorkflowEvent::WorkflowCompleted(e) => Some(entry(
                "workflow_completed",
                None,
                Some(serde_json::json!({
                    "total_tasks": e.extra_data.total_tasks,
                    "content_preview": e.content.as_deref().map(|c| truncate_str(c, 200)),
                })),
            )),
            WorkflowEvent::WorkflowError(e) => Some(entry(
                "workflow_error",
                None,
                Some(serde_json::json!({ "error": e.error })),
            )),

            // L2: task results
            WorkflowEvent::TaskCompleted(e) if self.level >= 2 => Some(entry(
                "task_completed",
                Some(&e.task_name),
                Some(serde_json::json!({
                    "index": e.task_index,
                    "content_type": e.content_type,
                    "content_preview": e.content.as_deref().map(|c| truncate_str(c, 200)),
                })),
            )),
            WorkflowEvent::TaskError(e) if self.level >= 2 => Some(entry(
                "task_error",
                Some(&e.task_name),
                Some(serde_json::json!({ "index": e.task_index, "error": e.error })),
            )),

            // L3: everything else
            WorkflowEvent::TaskStarted(e) if self.level >= 3 => Some(entry(
                "task_started",
                Some(&e.task_name),
                Some(serde_json::json!({ "index": e.task_index })),
            )),

            _ => None,
        }
    }
}

/// Truncate a string for logging, respecting char boundaries.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
