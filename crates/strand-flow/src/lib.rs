//! Workflow execution engine.
//!
//! A [`Workflow`] owns named [`Sequence`]s. A sequence is an ordered list of
//! [`Step`]s: tasks backed by an agent, team or function, nested sequences,
//! and the control-flow primitives in [`control`]. Every run reports progress
//! as [`WorkflowEvent`](strand_core::WorkflowEvent)s.

pub mod context;
pub mod control;
pub mod retry;
pub mod run_log;
pub mod sequence;
pub mod step;
pub mod stream;
pub mod task;
pub mod workflow;

pub use context::RunContext;
pub use control::{Choice, Choices, Condition, Loop, Parallel, Router};
pub use retry::{Backoff, RetryPolicy};
pub use run_log::RunLogger;
pub use sequence::{Sequence, SequenceDescription};
pub use step::{Step, StepDescription};
pub use stream::{BlockingRunStream, RunStream};
pub use task::{Executor, FieldType, FunctionOutput, Task, TaskBuilder, TaskFn};
pub use workflow::{RunRequest, Workflow, WorkflowDescription, WorkflowRunResponse};
