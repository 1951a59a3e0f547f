use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use strand_core::error::Result;
use strand_core::io::{StepInput, StepOutput};
use strand_core::types::ExecutorType;

use crate::context::RunContext;
use crate::control::{Condition, Loop, Parallel, Router};
use crate::sequence::{run_steps, Sequence};
use crate::task::Task;

/// One element of a sequence.
///
/// Every variant runs through the same `execute` contract, so primitives nest
/// freely: a loop body may hold a condition wrapping a parallel of sequences.
#[derive(Clone)]
pub enum Step {
    Task(Arc<Task>),
    Steps(Arc<Sequence>),
    Condition(Arc<Condition>),
    Loop(Arc<Loop>),
    Router(Arc<Router>),
    Parallel(Arc<Parallel>),
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Self::Task(t) => t.name(),
            Self::Steps(s) => s.name(),
            Self::Condition(c) => c.name(),
            Self::Loop(l) => l.name(),
            Self::Router(r) => r.name(),
            Self::Parallel(p) => p.name(),
        }
    }

    pub fn executor_type(&self) -> ExecutorType {
        match self {
            Self::Task(t) => t.executor_type(),
            Self::Steps(_) => ExecutorType::Steps,
            Self::Condition(_) => ExecutorType::Condition,
            Self::Loop(_) => ExecutorType::Loop,
            Self::Router(_) => ExecutorType::Router,
            Self::Parallel(_) => ExecutorType::Parallel,
        }
    }

    pub fn executor_name(&self) -> &str {
        match self {
            Self::Task(t) => t.executor_name(),
            other => other.name(),
        }
    }

    /// Run this element against `input`.
    ///
    /// A task yields exactly one output. Composite elements yield the outputs
    /// of whatever they ran, which may be none (a condition that evaluated
    /// false).
    pub fn execute<'a>(
        &'a self,
        input: &'a StepInput,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<Vec<StepOutput>>> {
        Box::pin(async move {
            match self {
                Self::Task(task) => task.execute(input, ctx).await.map(|o| vec![o]),
                Self::Steps(seq) => run_steps(seq.steps(), input.clone(), ctx)
                    .await
                    .map(|chained| chained.outputs),
                Self::Condition(condition) => condition.execute(input, ctx).await,
                Self::Loop(lp) => lp.execute(input, ctx).await,
                Self::Router(router) => router.execute(input, ctx).await,
                Self::Parallel(parallel) => parallel.execute(input, ctx).await,
            }
        })
    }

    pub fn describe(&self) -> StepDescription {
        let (description, steps) = match self {
            Self::Task(t) => (t.description().map(String::from), Vec::new()),
            Self::Steps(s) => (s.description().map(String::from), describe_all(s.steps())),
            Self::Condition(c) => (c.description().map(String::from), describe_all(c.steps())),
            Self::Loop(l) => (l.description().map(String::from), describe_all(l.steps())),
            Self::Router(r) => (r.description().map(String::from), describe_all(r.choices().steps())),
            Self::Parallel(p) => (p.description().map(String::from), describe_all(p.branches())),
        };
        StepDescription {
            name: self.name().to_string(),
            executor_type: self.executor_type(),
            executor_name: self.executor_name().to_string(),
            description,
            steps,
        }
    }
}

pub(crate) fn describe_all(steps: &[Step]) -> Vec<StepDescription> {
    steps.iter().map(Step::describe).collect()
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name())
            .field("executor_type", &self.executor_type())
            .finish()
    }
}

/// Serializable outline of a step and its children.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDescription {
    pub name: String,
    pub executor_type: ExecutorType,
    pub executor_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepDescription>,
}

impl From<Task> for Step {
    fn from(task: Task) -> Self {
        Self::Task(Arc::new(task))
    }
}

impl From<Arc<Task>> for Step {
    fn from(task: Arc<Task>) -> Self {
        Self::Task(task)
    }
}

impl From<Sequence> for Step {
    fn from(seq: Sequence) -> Self {
        Self::Steps(Arc::new(seq))
    }
}

impl From<Condition> for Step {
    fn from(condition: Condition) -> Self {
        Self::Condition(Arc::new(condition))
    }
}

impl From<Loop> for Step {
    fn from(lp: Loop) -> Self {
        Self::Loop(Arc::new(lp))
    }
}

impl From<Router> for Step {
    fn from(router: Router) -> Self {
        Self::Router(Arc::new(router))
    }
}

impl From<Parallel> for Step {
    fn from(parallel: Parallel) -> Self {
        Self::Parallel(Arc::new(parallel))
    }
}
