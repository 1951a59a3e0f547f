use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use strand_core::error::{Result, StrandError};
use strand_core::io::{StepInput, StepOutput};

use crate::context::RunContext;
use crate::sequence::run_steps;
use crate::step::Step;

type EndCondition =
    Arc<dyn Fn(&[StepOutput]) -> std::result::Result<bool, String> + Send + Sync>;

/// Repeats its body until the end condition holds or `max_iterations` runs.
///
/// Every iteration starts from the loop's own input. The end condition sees
/// every output produced so far, across all iterations. The loop's own output
/// is the final iteration's outputs.
pub struct Loop {
    name: String,
    description: Option<String>,
    steps: Vec<Step>,
    max_iterations: usize,
    end_condition: Option<EndCondition>,
}

impl Loop {
    pub fn new(name: impl Into<String>, steps: Vec<Step>, max_iterations: usize) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
            max_iterations,
            end_condition: None,
        }
    }

    pub fn with_end_condition<F>(self, end_condition: F) -> Self
    where
        F: Fn(&[StepOutput]) -> bool + Send + Sync + 'static,
    {
        self.try_with_end_condition(move |outputs: &[StepOutput]| {
            Ok::<_, std::convert::Infallible>(end_condition(outputs))
        })
    }

    pub fn try_with_end_condition<F, E>(mut self, end_condition: F) -> Self
    where
        F: Fn(&[StepOutput]) -> std::result::Result<bool, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        self.end_condition = Some(Arc::new(move |outputs: &[StepOutput]| {
            end_condition(outputs).map_err(|e| e.to_string())
        }));
        self
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

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub async fn execute(&self, input: &StepInput, ctx: &RunContext) -> Result<Vec<StepOutput>> {
        if self.max_iterations == 0 {
            warn!(loop_name = %self.name, "Loop has max_iterations = 0, body never runs");
            return Ok(Vec::new());
        }

        let mut all_outputs: Vec<StepOutput> = Vec::new();
        let mut last_outputs = Vec::new();
        let mut iterations = 0;

        while iterations < self.max_iterations {
            iterations += 1;
            debug!(loop_name = %self.name, iteration = iterations, max = self.max_iterations, "Loop iteration");

            let chained = run_steps(&self.steps, input.clone(), ctx).await?;
            all_outputs.extend(chained.outputs.iter().cloned());
            last_outputs = chained.outputs;

            if let Some(end_condition) = &self.end_condition {
                let done = end_condition(&all_outputs)
                    .map_err(|e| StrandError::evaluator(&self.name, e))?;
                if done {
                    info!(loop_name = %self.name, iterations, "Loop end condition met");
                    break;
                }
            }
        }

        debug!(loop_name = %self.name, iterations, "Loop finished");
        Ok(last_outputs)
    }
}

impl fmt::Debug for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop")
            .field("name", &self.name)
            .field("max_iterations", &self.max_iterations)
            .field("steps", &self.steps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::task::Task;

    fn counting_step(counter: Arc<AtomicUsize>) -> Step {
        Task::from_fn("draft", move |_: &StepInput| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            format!("draft {}", n)
        })
        .into()
    }

    #[tokio::test]
    async fn test_runs_to_max_when_condition_never_holds() {
        let counter = Arc::new(AtomicUsize::new(0));
        let lp = Loop::new("refine", vec![counting_step(counter.clone())], 3).with_end_condition(
            |outputs: &[StepOutput]| {
                outputs
                    .last()
                    .and_then(|o| o.content.as_deref())
                    .map_or(false, |c| c.contains("X"))
            },
        );

        let outputs = lp
            .execute(&StepInput::new("x"), &RunContext::new("wf", "main"))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].content.as_deref(), Some("draft 3"));
    }

    #[tokio::test]
    async fn test_stops_early_and_sees_all_outputs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let lp = Loop::new("refine", vec![counting_step(counter.clone())], 10)
            .with_end_condition(|outputs: &[StepOutput]| outputs.len() >= 2);

        let outputs = lp
            .execute(&StepInput::new("x"), &RunContext::new("wf", "main"))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(outputs[0].content.as_deref(), Some("draft 2"));
    }

    #[tokio::test]
    async fn test_each_iteration_starts_from_loop_input() {
        let lp = Loop::new(
            "grow",
            vec![Task::from_fn("grow", |i: &StepInput| {
                format!("{}+", i.previous_step_content.as_deref().unwrap_or(""))
            })
            .into()],
            3,
        );

        let outputs = lp
            .execute(&StepInput::new("x"), &RunContext::new("wf", "main"))
            .await
            .unwrap();
        assert_eq!(outputs[0].content.as_deref(), Some("+"));
    }

    #[tokio::test]
    async fn test_body_sees_outer_content_every_iteration() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let lp = Loop::new(
            "poll",
            vec![Task::from_fn("check", move |i: &StepInput| {
                record.lock().unwrap().push(i.previous_step_content.clone());
                "iter"
            })
            .into()],
            3,
        );

        let mut input = StepInput::new("x");
        input.previous_step_content = Some("loop-input".to_string());
        lp.execute(&input, &RunContext::new("wf", "main")).await.unwrap();

        let expected = vec![Some("loop-input".to_string()); 3];
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_end_condition_error_is_fatal() {
        let counter = Arc::new(AtomicUsize::new(0));
        let lp = Loop::new("refine", vec![counting_step(counter.clone())], 5)
            .try_with_end_condition(|_: &[StepOutput]| Err::<bool, _>("bad predicate"));

        let err = lp
            .execute(&StepInput::new("x"), &RunContext::new("wf", "main"))
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::Evaluator { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
