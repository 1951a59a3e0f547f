use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use strand_core::config::AppConfig;
use strand_core::error::{Result, StrandError};
use strand_core::event::{CompletionSummary, EventBus, WorkflowErrorEvent, WorkflowEvent};
use strand_core::io::{SessionState, StepInput, StepOutput};
use strand_core::session::WorkflowSession;
use strand_core::traits::WorkflowStore;
use strand_core::types::{Media, RunId, SessionId};
use strand_memory::queue::{JsonQueue, QueueStatus};

use crate::context::RunContext;
use crate::run_log::RunLogger;
use crate::sequence::{final_content, summarize, Sequence, SequenceDescription};
use crate::stream::{BlockingRunStream, RunStream};

type SequenceSelector = Arc<dyn Fn(&Value, &[&str]) -> Option<String> + Send + Sync>;

/// Session state of one session, `None` until first loaded. Holding the lock
/// for the length of a run serializes runs against that session.
///
/// A slot is dropped once its last run finishes if the state can be rebuilt:
/// always for generated session ids, and for every session when a store is
/// configured. Without a store, named sessions stay cached for the life of
/// the workflow.
type SessionSlot = Arc<Mutex<Option<SessionState>>>;

/// One invocation of a workflow.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Plain text or structured JSON message.
    pub message: Value,
    pub sequence_name: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    /// Use a caller-chosen run id (e.g. one assigned by the deferred-run queue).
    pub run_id: Option<String>,
    pub media: Media,
}

impl RunRequest {
    pub fn new(message: impl Into<Value>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_sequence(mut self, name: impl Into<String>) -> Self {
        self.sequence_name = Some(name.into());
        self
    }

    /// Older name for [`RunRequest::with_sequence`].
    pub fn with_pipeline(self, name: impl Into<String>) -> Self {
        self.with_sequence(name)
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_media(mut self, media: Media) -> Self {
        self.media = media;
        self
    }
}

/// Final result of a non-streaming run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunResponse {
    pub run_id: String,
    pub session_id: String,
    pub workflow_name: String,
    pub sequence_name: String,
    pub content: Option<String>,
    pub content_type: String,
    pub task_responses: Vec<StepOutput>,
    pub extra_data: CompletionSummary,
    /// Session state as it stood when the run finished.
    pub session_state: Map<String, Value>,
}

impl WorkflowRunResponse {
    /// Human-readable report of the run.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Workflow: {} (sequence: {})", self.workflow_name, self.sequence_name);
        let _ = writeln!(out, "Run: {}  Session: {}", self.run_id, self.session_id);
        let _ = writeln!(
            out,
            "Status: {}, {} task(s)",
            self.extra_data.status, self.extra_data.total_tasks
        );
        for (i, task) in self.extra_data.task_summary.iter().enumerate() {
            let _ = writeln!(
                out,
                "  {}. {} [{}: {}]",
                i + 1,
                task.task_name,
                task.executor_type,
                task.executor_name
            );
        }
        let failed: Vec<&StepOutput> = self.task_responses.iter().filter(|o| !o.success).collect();
        for output in failed {
            let _ = writeln!(
                out,
                "  ! {} failed: {}",
                output.step_name.as_deref().unwrap_or("?"),
                output.error.as_deref().unwrap_or("unknown error")
            );
        }
        out.push('\n');
        out.push_str(self.content.as_deref().unwrap_or("(no content)"));
        out
    }
}

/// Serializable outline of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDescription {
    pub name: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub sequences: Vec<SequenceDescription>,
}

struct Prepared {
    sequence: Arc<Sequence>,
    run_id: String,
    session_id: String,
    generated_session: bool,
}

/// Top-level orchestrator: owns named sequences, resolves which one a request
/// runs, and manages session state across runs.
///
/// Runs against one session id are serialized. Runs against different
/// sessions proceed concurrently.
pub struct Workflow {
    name: String,
    workflow_id: String,
    description: Option<String>,
    sequences: Vec<Arc<Sequence>>,
    selector: Option<SequenceSelector>,
    default_state: Map<String, Value>,
    store: Option<Arc<dyn WorkflowStore>>,
    event_bus: Arc<EventBus>,
    event_buffer: usize,
    run_log: Option<(PathBuf, u8)>,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    shutdown: CancellationToken,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workflow_id: Uuid::new_v4().to_string(),
            description: None,
            sequences: Vec::new(),
            selector: None,
            default_state: Map::new(),
            store: None,
            event_bus: Arc::new(EventBus::default()),
            event_buffer: 64,
            run_log: None,
            sessions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Apply engine and logging settings from the app config.
    pub fn with_config(mut self, config: &AppConfig) -> Self {
        self.event_buffer = config.engine.event_buffer.max(1);
        if let Some(log) = config.log.as_ref().filter(|l| l.enabled) {
            self.run_log = Some((config.log_dir(), log.level));
        }
        self
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = workflow_id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.add_sequence(sequence);
        self
    }

    /// Pick a sequence when several are registered and the request names none.
    ///
    /// The selector sees the message and the registered names; returning
    /// `None` falls back to the first registered sequence.
    pub fn with_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&Value, &[&str]) -> Option<String> + Send + Sync + 'static,
    {
        self.selector = Some(Arc::new(selector));
        self
    }

    /// Defaults seeded into a session's state the first time it is used.
    pub fn with_session_state(mut self, defaults: Map<String, Value>) -> Self {
        self.default_state = defaults;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = bus;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Write a JSONL log of every run under `log_dir`.
    pub fn with_run_log(mut self, log_dir: impl Into<PathBuf>, level: u8) -> Self {
        self.run_log = Some((log_dir.into(), level));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Bus carrying the events of every run of this workflow.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn add_sequence(&mut self, sequence: Sequence) {
        self.sequences.push(Arc::new(sequence));
    }

    pub fn remove_sequence(&mut self, name: &str) -> Option<Arc<Sequence>> {
        let pos = self.sequences.iter().position(|s| s.name() == name)?;
        Some(self.sequences.remove(pos))
    }

    pub fn get_sequence(&self, name: &str) -> Option<&Sequence> {
        self.sequences
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
    }

    pub fn list_sequences(&self) -> Vec<&str> {
        self.sequences.iter().map(|s| s.name()).collect()
    }

    pub fn describe(&self) -> WorkflowDescription {
        WorkflowDescription {
            name: self.name.clone(),
            workflow_id: self.workflow_id.clone(),
            description: self.description.clone(),
            sequences: self.sequences.iter().map(|s| s.describe()).collect(),
        }
    }

    /// Decide which sequence a request runs.
    pub fn resolve_sequence(&self, req: &RunRequest) -> Result<Arc<Sequence>> {
        let first = self
            .sequences
            .first()
            .ok_or_else(|| StrandError::NoSequences(self.name.clone()))?;

        let chosen = match (&req.sequence_name, &self.selector) {
            (Some(name), _) => Some(name.clone()),
            (None, Some(selector)) if self.sequences.len() > 1 => {
                selector(&req.message, &self.list_sequences())
            }
            _ => None,
        };

        match chosen {
            Some(name) => self
                .sequences
                .iter()
                .find(|s| s.name() == name)
                .cloned()
                .ok_or(StrandError::SequenceNotFound(name)),
            None => Ok(Arc::clone(first)),
        }
    }

    /// Current state of a session this workflow still caches, if any.
    ///
    /// Waits for an in-flight run of that session to finish.
    pub async fn session_state(&self, session_id: &str) -> Option<Map<String, Value>> {
        let slot = self.sessions.lock().await.get(session_id).cloned()?;
        let guard = slot.lock().await;
        guard.as_ref().map(SessionState::snapshot)
    }

    /// Run to completion and return the final result.
    ///
    /// Errors are returned as `Err`; task events still reach the event bus.
    pub async fn run(&self, req: RunRequest) -> Result<WorkflowRunResponse> {
        let prepared = self.prepare(&req)?;
        let run_id = prepared.run_id.clone();
        let session_id = prepared.session_id.clone();
        let sequence_name = prepared.sequence.name().to_string();

        let (outputs, session_state) = self.execute(prepared, req, None).await?;
        let (content, content_type) = final_content(&outputs);

        Ok(WorkflowRunResponse {
            run_id,
            session_id,
            workflow_name: self.name.clone(),
            sequence_name,
            content,
            content_type,
            extra_data: summarize(&outputs),
            task_responses: outputs,
            session_state,
        })
    }

    /// Start a run and return its live event stream.
    ///
    /// Sequence resolution errors are returned here, before anything runs.
    /// Everything after that is reported in the stream.
    pub async fn run_stream(self: &Arc<Self>, req: RunRequest) -> Result<RunStream> {
        let prepared = self.prepare(&req)?;
        let run_id = prepared.run_id.clone();
        let session_id = prepared.session_id.clone();
        let (tx, rx) = mpsc::channel(self.event_buffer);

        let this = Arc::clone(self);
        let handle: JoinHandle<Result<Vec<StepOutput>>> = tokio::spawn(async move {
            this.execute(prepared, req, Some(tx))
                .await
                .map(|(outputs, _)| outputs)
        });

        Ok(RunStream::new(run_id, session_id, rx, handle))
    }

    /// Blocking flavor of [`Workflow::run`] on a private runtime.
    ///
    /// Must not be called from inside an async context.
    pub fn run_blocking(&self, req: RunRequest) -> Result<WorkflowRunResponse> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run(req))
    }

    /// Blocking flavor of [`Workflow::run_stream`]: a worker thread drives
    /// the run and the returned iterator yields its events.
    pub fn stream_blocking(self: &Arc<Self>, req: RunRequest) -> Result<BlockingRunStream> {
        let prepared = self.prepare(&req)?;
        let run_id = prepared.run_id.clone();
        let session_id = prepared.session_id.clone();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, rx) = mpsc::channel(self.event_buffer);

        let this = Arc::clone(self);
        let worker = std::thread::Builder::new()
            .name("strand-run".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    this.execute(prepared, req, Some(tx))
                        .await
                        .map(|(outputs, _)| outputs)
                })
            })?;

        Ok(BlockingRunStream::new(run_id, session_id, rx, worker))
    }

    /// Take the oldest queued run for this workflow and execute it.
    ///
    /// The item is marked `running` first, then `completed` or `failed`.
    /// Returns `Ok(None)` when nothing is queued.
    pub async fn process_next_queued(&self, queue: &JsonQueue) -> Result<Option<WorkflowRunResponse>> {
        let Some(item) = queue.get_next_queued(&self.workflow_id)? else {
            return Ok(None);
        };
        queue.update_status(&item.run_id, QueueStatus::Running)?;
        info!(run_id = %item.run_id, workflow = %self.name, "Processing queued run");

        let mut req = RunRequest::new(item.query.clone()).with_run_id(item.run_id.clone());
        if !item.sequence_name.is_empty() {
            req = req.with_sequence(item.sequence_name.clone());
        }
        if let Some(session_id) = &item.session_id {
            req = req.with_session(session_id.clone());
        }
        if let Some(user_id) = &item.user_id {
            req = req.with_user(user_id.clone());
        }

        match self.run(req).await {
            Ok(response) => {
                queue.update_status(&item.run_id, QueueStatus::Completed)?;
                Ok(Some(response))
            }
            Err(e) => {
                warn!(run_id = %item.run_id, error = %e, "Queued run failed");
                queue.update_status(&item.run_id, QueueStatus::Failed)?;
                Err(e)
            }
        }
    }

    fn prepare(&self, req: &RunRequest) -> Result<Prepared> {
        let sequence = self.resolve_sequence(req)?;
        Ok(Prepared {
            sequence,
            run_id: req.run_id.clone().unwrap_or_else(|| RunId::new().0),
            session_id: req.session_id.clone().unwrap_or_else(|| SessionId::new().0),
            generated_session: req.session_id.is_none(),
        })
    }

    async fn execute(
        &self,
        prepared: Prepared,
        req: RunRequest,
        events: Option<mpsc::Sender<WorkflowEvent>>,
    ) -> Result<(Vec<StepOutput>, Map<String, Value>)> {
        let Prepared {
            sequence,
            run_id,
            session_id,
            generated_session,
        } = prepared;

        let slot = self.slot(&session_id).await;
        let mut guard = slot.lock().await;

        let mut ctx = RunContext::new(&self.name, sequence.name())
            .with_run_id(run_id)
            .with_session(session_id.clone(), req.user_id.clone())
            .with_event_bus(Arc::clone(&self.event_bus));
        if let Some(tx) = events {
            ctx = ctx.with_events(tx);
        }
        let logger = self.spawn_run_logger(&ctx);

        let state = match guard.as_ref() {
            Some(state) => Ok(state.clone()),
            None => self.load_state(&session_id).await,
        };
        let result = match state {
            Ok(state) => {
                *guard = Some(state.clone());
                ctx.session_state = state.clone();
                let input = StepInput::new(req.message.clone())
                    .with_media(req.media.clone())
                    .with_session_state(state);
                sequence.run(input, &ctx).await
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Failed to load session state");
                let _ = ctx
                    .emit(WorkflowEvent::WorkflowError(WorkflowErrorEvent {
                        run_id: ctx.run_id.clone(),
                        session_id: ctx.session_id.clone(),
                        workflow_name: ctx.workflow_name.clone(),
                        sequence_name: ctx.sequence_name.clone(),
                        error: e.to_string(),
                        content: None,
                        created_at: chrono::Utc::now().timestamp(),
                    }))
                    .await;
                Err(e)
            }
        };

        if let Err(e) = self.persist(&ctx, &req, &result).await {
            warn!(run_id = %ctx.run_id, error = %e, "Failed to persist run");
        }
        let snapshot = ctx.session_state.snapshot();
        drop(guard);
        if generated_session || self.store.is_some() {
            self.release(&session_id, slot).await;
        }

        if let Some((cancel, handle)) = logger {
            cancel.cancel();
            let _ = handle.await;
        }

        result.map(|outputs| (outputs, snapshot))
    }

    async fn slot(&self, session_id: &str) -> SessionSlot {
        let mut sessions = self.sessions.lock().await;
        Arc::clone(sessions.entry(session_id.to_string()).or_default())
    }

    /// Forget a session's slot unless another run is waiting on it.
    async fn release(&self, session_id: &str, slot: SessionSlot) {
        let mut sessions = self.sessions.lock().await;
        // One reference in the map, one held here.
        if Arc::strong_count(&slot) == 2 {
            sessions.remove(session_id);
            debug!(session_id, "Released session slot");
        }
    }

    /// Persisted state of a session, or a fresh one, seeded with the defaults.
    async fn load_state(&self, session_id: &str) -> Result<SessionState> {
        let mut state = SessionState::new();
        if let Some(store) = &self.store {
            if let Some(saved) = store
                .read_session(session_id)
                .await?
                .and_then(|s| s.session_state().cloned())
            {
                debug!(session_id, keys = saved.len(), "Restored session state");
                state = SessionState::from_map(saved);
            }
        }
        state.seed(&self.default_state);
        Ok(state)
    }

    async fn persist(
        &self,
        ctx: &RunContext,
        req: &RunRequest,
        result: &Result<Vec<StepOutput>>,
    ) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let mut session = store
            .read_session(&ctx.session_id)
            .await?
            .unwrap_or_else(|| WorkflowSession::new(ctx.session_id.clone(), self.workflow_id.clone()));
        session.workflow_name = Some(self.name.clone());
        if ctx.user_id.is_some() {
            session.user_id = ctx.user_id.clone();
        }
        session.set_session_state(ctx.session_state.snapshot());
        session.updated_at = chrono::Utc::now();

        let mut run = json!({
            "run_id": ctx.run_id,
            "sequence_name": ctx.sequence_name,
            "message": req.message,
            "created_at": chrono::Utc::now().to_rfc3339(),
        });
        let fields = match result {
            Ok(outputs) => {
                let (content, content_type) = final_content(outputs);
                json!({
                    "status": "completed",
                    "content": content,
                    "content_type": content_type,
                    "task_responses": outputs,
                })
            }
            Err(e) => json!({ "status": "error", "error": e.to_string() }),
        };
        if let (Some(run), Value::Object(fields)) = (run.as_object_mut(), fields) {
            run.extend(fields);
        }

        store.append_run(&session, run).await
    }

    fn spawn_run_logger(
        &self,
        ctx: &RunContext,
    ) -> Option<(CancellationToken, JoinHandle<Option<PathBuf>>)> {
        let (log_dir, level) = self.run_log.as_ref()?;
        let cancel = self.shutdown.child_token();
        let logger = RunLogger::new(log_dir.clone(), *level).for_run(ctx.run_id.clone());
        let handle = tokio::spawn(logger.run(
            Arc::clone(&self.event_bus),
            ctx.session_id.clone(),
            cancel.clone(),
        ));
        Some((cancel, handle))
    }
}

impl Drop for Workflow {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("workflow_id", &self.workflow_id)
            .field("sequences", &self.list_sequences())
            .field("has_store", &self.store.is_some())
            .finish()
    }
}
