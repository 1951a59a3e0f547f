use std::sync::Arc;

use tokio::sync::mpsc;

use strand_core::error::{Result, StrandError};
use strand_core::event::{EventBus, WorkflowEvent};
use strand_core::io::SessionState;
use strand_core::traits::ExecutorContext;
use strand_core::types::{RunId, SessionId};

/// Everything a step needs to know about the run it belongs to.
///
/// Cheap to clone: parallel branches each get their own handle to the same
/// event sink and session state.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub workflow_name: String,
    pub sequence_name: String,
    pub session_state: SessionState,
    events: Option<mpsc::Sender<WorkflowEvent>>,
    bus: Option<Arc<EventBus>>,
}

impl RunContext {
    pub fn new(workflow_name: impl Into<String>, sequence_name: impl Into<String>) -> Self {
        Self {
            run_id: RunId::new().0,
            session_id: SessionId::new().0,
            user_id: None,
            workflow_name: workflow_name.into(),
            sequence_name: sequence_name.into(),
            session_state: SessionState::new(),
            events: None,
            bus: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>, user_id: Option<String>) -> Self {
        self.session_id = session_id.into();
        self.user_id = user_id;
        self
    }

    pub fn with_session_state(mut self, state: SessionState) -> Self {
        self.session_state = state;
        self
    }

    /// Deliver events to a channel consumer.
    pub fn with_events(mut self, tx: mpsc::Sender<WorkflowEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Mirror events onto a broadcast bus.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Publish an event.
    ///
    /// Fails with `Cancelled` once the channel consumer has gone away, which
    /// stops the run at the next step boundary.
    pub async fn emit(&self, event: WorkflowEvent) -> Result<()> {
        if let Some(bus) = &self.bus {
            bus.publish(event.clone());
        }
        if let Some(tx) = &self.events {
            tx.send(event).await.map_err(|_| StrandError::Cancelled)?;
        }
        Ok(())
    }

    pub fn executor_context(&self, step_name: &str) -> ExecutorContext {
        ExecutorContext {
            run_id: self.run_id.clone(),
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            step_name: step_name.to_string(),
            session_state: self.session_state.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::event::TaskStartedEvent;

    fn started() -> WorkflowEvent {
        WorkflowEvent::TaskStarted(TaskStartedEvent {
            run_id: "r".into(),
            workflow_name: "wf".into(),
            sequence_name: "main".into(),
            task_name: "a".into(),
            task_index: 0,
            created_at: 0,
        })
    }

    #[tokio::test]
    async fn test_emit_reaches_channel_and_bus() {
        let (tx, mut rx) = mpsc::channel(4);
        let bus = Arc::new(EventBus::new(4));
        let mut sub = bus.subscribe();
        let ctx = RunContext::new("wf", "main").with_events(tx).with_event_bus(bus);

        ctx.emit(started()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind(), "TaskStarted");
        assert_eq!(sub.recv().await.unwrap().kind(), "TaskStarted");
    }

    #[tokio::test]
    async fn test_emit_after_consumer_dropped_is_cancelled() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let ctx = RunContext::new("wf", "main").with_events(tx);
        assert!(matches!(ctx.emit(started()).await, Err(StrandError::Cancelled)));
    }

    #[tokio::test]
    async fn test_emit_without_sink_is_noop() {
        let ctx = RunContext::new("wf", "main");
        ctx.emit(started()).await.unwrap();
    }
}
