use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use strand_core::error::{Result, StrandError};
use strand_core::io::{StepInput, StepOutput};

use crate::context::RunContext;
use crate::sequence::run_steps;
use crate::step::Step;

type Verdict = BoxFuture<'static, std::result::Result<bool, String>>;
type Evaluator = Arc<dyn Fn(StepInput) -> Verdict + Send + Sync>;

/// Runs its steps only when the evaluator says so.
///
/// A false evaluation produces no output, so the enclosing sequence records
/// nothing for this position. An evaluator error fails the run.
pub struct Condition {
    name: String,
    description: Option<String>,
    evaluator: Evaluator,
    steps: Vec<Step>,
}

impl Condition {
    pub fn new<F>(name: impl Into<String>, evaluator: F, steps: Vec<Step>) -> Self
    where
        F: Fn(&StepInput) -> bool + Send + Sync + 'static,
    {
        Self::try_new(
            name,
            move |input: &StepInput| Ok::<_, std::convert::Infallible>(evaluator(input)),
            steps,
        )
    }

    pub fn try_new<F, E>(name: impl Into<String>, evaluator: F, steps: Vec<Step>) -> Self
    where
        F: Fn(&StepInput) -> std::result::Result<bool, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        let evaluator: Evaluator = Arc::new(move |input: StepInput| -> Verdict {
            let verdict = evaluator(&input).map_err(|e| e.to_string());
            Box::pin(async move { verdict })
        });
        Self::with_evaluator(name.into(), evaluator, steps)
    }

    pub fn new_async<F, Fut>(name: impl Into<String>, evaluator: F, steps: Vec<Step>) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let evaluator: Evaluator = Arc::new(move |input: StepInput| -> Verdict {
            let fut = evaluator(input);
            Box::pin(async move { Ok(fut.await) })
        });
        Self::with_evaluator(name.into(), evaluator, steps)
    }

    pub fn try_new_async<F, Fut, E>(name: impl Into<String>, evaluator: F, steps: Vec<Step>) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<bool, E>> + Send + 'static,
        E: fmt::Display,
    {
        let evaluator: Evaluator = Arc::new(move |input: StepInput| -> Verdict {
            let fut = evaluator(input);
            Box::pin(async move { fut.await.map_err(|e| e.to_string()) })
        });
        Self::with_evaluator(name.into(), evaluator, steps)
    }

    fn with_evaluator(name: String, evaluator: Evaluator, steps: Vec<Step>) -> Self {
        Self {
            name,
            description: None,
            evaluator,
            steps,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub async fn evaluate(&self, input: &StepInput) -> Result<bool> {
        (self.evaluator)(input.clone())
            .await
            .map_err(|e| StrandError::evaluator(&self.name, e))
    }

    pub async fn execute(&self, input: &StepInput, ctx: &RunContext) -> Result<Vec<StepOutput>> {
        if !self.evaluate(input).await? {
            info!(condition = %self.name, "Condition false, skipping steps");
            return Ok(Vec::new());
        }

        debug!(condition = %self.name, steps = self.steps.len(), "Condition true");
        Ok(run_steps(&self.steps, input.clone(), ctx).await?.outputs)
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .finish()
    }
}
