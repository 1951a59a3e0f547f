use std::fmt;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use strand_core::error::Result;
use strand_core::io::{StepInput, StepOutput};
use strand_core::types::ExecutorType;

use crate::context::RunContext;
use crate::sequence::run_element;
use crate::step::Step;

/// Runs every branch concurrently against the same input.
///
/// The result is a single aggregate output whose `children` hold one entry per
/// branch, in declaration order regardless of completion order. Branches do
/// not see each other's outputs. If any branch fails, the others still run to
/// completion and the first failure in branch order is returned.
pub struct Parallel {
    name: String,
    description: Option<String>,
    branches: Vec<Step>,
}

impl Parallel {
    pub fn new(name: impl Into<String>, branches: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: None,
            branches,
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

    pub fn branches(&self) -> &[Step] {
        &self.branches
    }

    pub async fn execute(&self, input: &StepInput, ctx: &RunContext) -> Result<Vec<StepOutput>> {
        debug!(parallel = %self.name, branches = self.branches.len(), "Running branches");

        let futures = self
            .branches
            .iter()
            .enumerate()
            .map(|(index, branch)| run_element(branch, index, input, ctx));
        let results = join_all(futures).await;

        let mut children = Vec::with_capacity(results.len());
        for (branch, result) in self.branches.iter().zip(results) {
            let outputs = match result {
                Ok(outputs) => outputs,
                Err(e) => {
                    warn!(parallel = %self.name, branch = %branch.name(), error = %e, "Branch failed");
                    return Err(e);
                }
            };

            let child = if outputs.is_empty() {
                StepOutput::default()
                    .identify(branch.name(), None, branch.executor_type(), branch.name())
                    .with_metadata("skipped", Value::Bool(true))
            } else {
                StepOutput::collapse(branch.name(), branch.executor_type(), outputs)
            };
            children.push(child);
        }

        Ok(vec![StepOutput::aggregate(children).identify(
            &self.name,
            None,
            ExecutorType::Parallel,
            &self.name,
        )])
    }
}

impl fmt::Debug for Parallel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parallel")
            .field("name", &self.name)
            .field("branches", &self.branches)
            .finish()
    }
}
