//! Workflow event protocol.
//!
//! Every run produces a trace of `WorkflowEvent`s. Each event serializes to a
//! flat JSON record discriminated by its `event` field.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::io::StepOutput;
use crate::types::{ChatMessage, MediaArtifact};

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStartedEvent {
    pub run_id: String,
    pub session_id: String,
    pub workflow_name: String,
    pub sequence_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default = "now_ts")]
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStartedEvent {
    pub run_id: String,
    pub workflow_name: String,
    pub sequence_name: String,
    pub task_name: String,
    pub task_index: usize,
    #[serde(default = "now_ts")]
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskCompletedEvent {
    pub run_id: String,
    pub workflow_name: String,
    pub sequence_name: String,
    pub task_name: String,
    pub task_index: usize,
    #[serde(default)]
    pub content: Option<String>,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<MediaArtifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub videos: Vec<MediaArtifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<MediaArtifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
    #[serde(default)]
    pub task_responses: Vec<StepOutput>,
    #[serde(default = "now_ts")]
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskErrorEvent {
    pub run_id: String,
    pub workflow_name: String,
    pub sequence_name: String,
    pub task_name: String,
    pub task_index: usize,
    pub error: String,
    #[serde(default = "now_ts")]
    pub created_at: i64,
}

/// One line of the completion summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSummary {
    pub task_name: String,
    pub executor_type: String,
    pub executor_name: String,
}

/// The `extra_data` block of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionSummary {
    pub status: String,
    pub total_tasks: usize,
    pub task_summary: Vec<TaskSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowCompletedEvent {
    pub run_id: String,
    pub session_id: String,
    pub workflow_name: String,
    pub sequence_name: String,
    #[serde(default)]
    pub content: Option<String>,
    pub content_type: String,
    #[serde(default)]
    pub task_responses: Vec<StepOutput>,
    pub extra_data: CompletionSummary,
    #[serde(default = "now_ts")]
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowErrorEvent {
    pub run_id: String,
    pub session_id: String,
    pub workflow_name: String,
    pub sequence_name: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default = "now_ts")]
    pub created_at: i64,
}

/// An immutable record of one occurrence during a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum WorkflowEvent {
    WorkflowStarted(WorkflowStartedEvent),
    TaskStarted(TaskStartedEvent),
    TaskCompleted(TaskCompletedEvent),
    TaskError(TaskErrorEvent),
    WorkflowCompleted(WorkflowCompletedEvent),
    WorkflowError(WorkflowErrorEvent),
}

impl WorkflowEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowStarted(_) => "WorkflowStarted",
            Self::TaskStarted(_) => "TaskStarted",
            Self::TaskCompleted(_) => "TaskCompleted",
            Self::TaskError(_) => "TaskError",
            Self::WorkflowCompleted(_) => "WorkflowCompleted",
            Self::WorkflowError(_) => "WorkflowError",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::WorkflowStarted(e) => &e.run_id,
            Self::TaskStarted(e) => &e.run_id,
            Self::TaskCompleted(e) => &e.run_id,
            Self::TaskError(e) => &e.run_id,
            Self::WorkflowCompleted(e) => &e.run_id,
            Self::WorkflowError(e) => &e.run_id,
        }
    }

    /// Name of the task this event is scoped to, if any.
    pub fn task_name(&self) -> Option<&str> {
        match self {
            Self::TaskStarted(e) => Some(&e.task_name),
            Self::TaskCompleted(e) => Some(&e.task_name),
            Self::TaskError(e) => Some(&e.task_name),
            _ => None,
        }
    }

    /// Whether this event ends the run's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::WorkflowCompleted(_) | Self::WorkflowError(_))
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
#[derive(Debug)]
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_error() -> WorkflowEvent {
        WorkflowEvent::TaskError(TaskErrorEvent {
            run_id: "run-1".into(),
            workflow_name: "wf".into(),
            sequence_name: "main".into(),
            task_name: "fetch".into(),
            task_index: 2,
            error: "timeout".into(),
            created_at: 0,
        })
    }

    #[test]
    fn test_event_serializes_flat() {
        let json: serde_json::Value = serde_json::from_str(&task_error().to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "TaskError");
        assert_eq!(json["task_name"], "fetch");
        assert_eq!(json["task_index"], 2);
        assert_eq!(json["error"], "timeout");
    }

    #[test]
    fn test_event_accessors() {
        let e = task_error();
        assert_eq!(e.kind(), "TaskError");
        assert_eq!(e.run_id(), "run-1");
        assert_eq!(e.task_name(), Some("fetch"));
        assert!(!e.is_terminal());
    }

    #[test]
    fn test_completed_event_parses() {
        let raw = r#"{
            "event": "WorkflowCompleted",
            "run_id": "r",
            "session_id": "s",
            "workflow_name": "wf",
            "sequence_name": "main",
            "content": "done",
            "content_type": "str",
            "task_responses": [{"content": "done"}],
            "extra_data": {"status": "completed", "total_tasks": 1, "task_summary": []}
        }"#;
        let event: WorkflowEvent = serde_json::from_str(raw).unwrap();
        assert!(event.is_terminal());
        match event {
            WorkflowEvent::WorkflowCompleted(e) => {
                assert_eq!(e.task_responses.len(), 1);
                assert!(e.task_responses[0].success);
                assert_eq!(e.extra_data.total_tasks, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bus_fans_out() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(task_error());
        assert_eq!(a.recv().await.unwrap().kind(), "TaskError");
        assert_eq!(b.recv().await.unwrap().kind(), "TaskError");
    }
}
