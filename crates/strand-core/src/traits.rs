use futures::future::BoxFuture;

use crate::error::Result;
use crate::io::SessionState;
use crate::session::WorkflowSession;
use crate::types::ExecutorResponse;

/// Run-scoped facts handed to agents and teams alongside their message.
#[derive(Debug, Clone)]
pub struct ExecutorContext {
    pub run_id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub step_name: String,
    /// Shared session blackboard; executors may read and write it.
    pub session_state: SessionState,
}

/// Agent: a single responder that turns a message into a response.
pub trait AgentExecutor: Send + Sync + 'static {
    /// Agent name (used in summaries and executor identity).
    fn name(&self) -> &str;

    /// Run the agent on a rendered message.
    fn run(&self, message: String, ctx: ExecutorContext) -> BoxFuture<'_, Result<ExecutorResponse>>;
}

/// Team: coordinates several agents behind the same call shape as an agent.
pub trait TeamExecutor: Send + Sync + 'static {
    /// Team name.
    fn name(&self) -> &str;

    /// Run the team on a rendered message.
    fn run(&self, message: String, ctx: ExecutorContext) -> BoxFuture<'_, Result<ExecutorResponse>>;

    /// Member names, for summaries.
    fn members(&self) -> Vec<String> {
        vec![]
    }
}

/// Workflow session store, the persistence backend.
pub trait WorkflowStore: Send + Sync + 'static {
    /// Fetch a session by id.
    fn read_session(&self, session_id: &str) -> BoxFuture<'_, Result<Option<WorkflowSession>>>;

    /// Create or replace a session record (runs are left untouched).
    fn upsert_session(&self, session: &WorkflowSession) -> BoxFuture<'_, Result<()>>;

    /// Append one serialized run to a session, creating the session if needed.
    fn append_run(
        &self,
        session: &WorkflowSession,
        run: serde_json::Value,
    ) -> BoxFuture<'_, Result<()>>;

    /// List sessions, optionally for a single workflow, most recent first.
    fn list_sessions(&self, workflow_id: Option<&str>) -> BoxFuture<'_, Result<Vec<WorkflowSession>>>;

    /// Set a session's display name. Returns false if the session does not exist.
    fn rename_session(&self, session_id: &str, name: &str) -> BoxFuture<'_, Result<bool>>;

    /// Delete a session and its runs. Returns false if nothing was deleted.
    fn delete_session(&self, session_id: &str) -> BoxFuture<'_, Result<bool>>;
}
