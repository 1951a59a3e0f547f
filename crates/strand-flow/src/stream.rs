use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use strand_core::error::{Result, StrandError};
use strand_core::event::WorkflowEvent;
use strand_core::io::StepOutput;

/// Live event stream of one workflow run.
///
/// Yields zero or more task events bracketed by `WorkflowStarted` and exactly
/// one terminal `WorkflowCompleted` or `WorkflowError`, then ends. Dropping
/// the stream stops the run at the next step boundary; an executor call
/// already in flight still runs to completion.
pub struct RunStream {
    run_id: String,
    session_id: String,
    rx: mpsc::Receiver<WorkflowEvent>,
    handle: JoinHandle<Result<Vec<StepOutput>>>,
}

impl RunStream {
    pub(crate) fn new(
        run_id: String,
        session_id: String,
        rx: mpsc::Receiver<WorkflowEvent>,
        handle: JoinHandle<Result<Vec<StepOutput>>>,
    ) -> Self {
        Self {
            run_id,
            session_id,
            rx,
            handle,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event, or `None` once the run has ended.
    pub async fn next_event(&mut self) -> Option<WorkflowEvent> {
        self.rx.recv().await
    }

    /// Drain the remaining events and wait for the run to finish, including
    /// persistence of the session.
    pub async fn finish(mut self) -> Result<Vec<StepOutput>> {
        while self.rx.recv().await.is_some() {}
        self.handle
            .await
            .map_err(|e| StrandError::executor(&self.run_id, format!("run task failed: {}", e)))?
    }
}

impl Stream for RunStream {
    type Item = WorkflowEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for RunStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStream")
            .field("run_id", &self.run_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Blocking counterpart of `RunStream` for callers without an async runtime.
///
/// A worker thread drives the run on its own runtime and feeds events through
/// a bounded channel; iteration blocks until the next event arrives. Must not
/// be iterated from inside an async context.
pub struct BlockingRunStream {
    run_id: String,
    session_id: String,
    rx: mpsc::Receiver<WorkflowEvent>,
    worker: std::thread::JoinHandle<Result<Vec<StepOutput>>>,
}

impl BlockingRunStream {
    pub(crate) fn new(
        run_id: String,
        session_id: String,
        rx: mpsc::Receiver<WorkflowEvent>,
        worker: std::thread::JoinHandle<Result<Vec<StepOutput>>>,
    ) -> Self {
        Self {
            run_id,
            session_id,
            rx,
            worker,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Drain the remaining events and join the worker thread.
    pub fn finish(mut self) -> Result<Vec<StepOutput>> {
        while self.rx.blocking_recv().is_some() {}
        self.worker
            .join()
            .map_err(|_| StrandError::executor(&self.run_id, "run worker thread panicked"))?
    }
}

impl Iterator for BlockingRunStream {
    type Item = WorkflowEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.blocking_recv()
    }
}

impl std::fmt::Debug for BlockingRunStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingRunStream")
            .field("run_id", &self.run_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}
