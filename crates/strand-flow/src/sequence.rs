use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use strand_core::error::{Result, StrandError};
use strand_core::event::{
    CompletionSummary, TaskCompletedEvent, TaskErrorEvent, TaskStartedEvent, TaskSummary,
    WorkflowCompletedEvent, WorkflowErrorEvent, WorkflowEvent, WorkflowStartedEvent,
};
use strand_core::io::{StepInput, StepOutput};
use strand_core::types::Media;

use crate::context::RunContext;
use crate::step::{describe_all, Step, StepDescription};

/// An ordered list of steps run one after another, each seeing the outputs
/// of everything before it.
#[derive(Debug, Clone)]
pub struct Sequence {
    name: String,
    sequence_id: String,
    description: Option<String>,
    steps: Vec<Step>,
}

impl Sequence {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            sequence_id: Uuid::new_v4().to_string(),
            description: None,
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

    pub fn sequence_id(&self) -> &str {
        &self.sequence_id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn add_step(&mut self, step: impl Into<Step>) {
        self.steps.push(step.into());
    }

    /// Remove the first step with the given name.
    pub fn remove_step(&mut self, name: &str) -> Option<Step> {
        let pos = self.steps.iter().position(|s| s.name() == name)?;
        Some(self.steps.remove(pos))
    }

    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name() == name)
    }

    pub fn describe(&self) -> SequenceDescription {
        SequenceDescription {
            name: self.name.clone(),
            sequence_id: self.sequence_id.clone(),
            description: self.description.clone(),
            steps: describe_all(&self.steps),
        }
    }

    /// Run this sequence as the top level of a workflow run.
    ///
    /// Emits `WorkflowStarted`, the task events of every step, then exactly
    /// one of `WorkflowCompleted` or `WorkflowError`. Returns the collected
    /// outputs of all steps in order.
    pub async fn run(&self, input: StepInput, ctx: &RunContext) -> Result<Vec<StepOutput>> {
        info!(
            run_id = %ctx.run_id,
            sequence = %self.name,
            steps = self.steps.len(),
            "Starting sequence"
        );

        let message = input.message_as_string();
        ctx.emit(WorkflowEvent::WorkflowStarted(WorkflowStartedEvent {
            run_id: ctx.run_id.clone(),
            session_id: ctx.session_id.clone(),
            workflow_name: ctx.workflow_name.clone(),
            sequence_name: ctx.sequence_name.clone(),
            content: (!message.is_empty()).then_some(message),
            created_at: chrono::Utc::now().timestamp(),
        }))
        .await?;

        match run_steps(&self.steps, input, ctx).await {
            Ok(chained) => {
                let outputs = chained.outputs;
                let (content, content_type) = final_content(&outputs);

                ctx.emit(WorkflowEvent::WorkflowCompleted(WorkflowCompletedEvent {
                    run_id: ctx.run_id.clone(),
                    session_id: ctx.session_id.clone(),
                    workflow_name: ctx.workflow_name.clone(),
                    sequence_name: ctx.sequence_name.clone(),
                    content,
                    content_type,
                    task_responses: outputs.clone(),
                    extra_data: summarize(&outputs),
                    created_at: chrono::Utc::now().timestamp(),
                }))
                .await?;

                info!(run_id = %ctx.run_id, outputs = outputs.len(), "Sequence completed");
                Ok(outputs)
            }
            Err(e) => {
                error!(run_id = %ctx.run_id, sequence = %self.name, error = %e, "Sequence failed");
                // The consumer may already be gone; the error is returned either way.
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
        }
    }
}

/// Serializable outline of a sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceDescription {
    pub name: String,
    pub sequence_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepDescription>,
}

/// Content of the last step that produced any, and the last output's content type.
pub(crate) fn final_content(outputs: &[StepOutput]) -> (Option<String>, String) {
    let content = outputs.iter().rev().find_map(|o| o.content.clone());
    let content_type = outputs
        .last()
        .map(|o| o.content_type())
        .unwrap_or("str")
        .to_string();
    (content, content_type)
}

pub(crate) fn summarize(outputs: &[StepOutput]) -> CompletionSummary {
    CompletionSummary {
        status: "completed".to_string(),
        total_tasks: outputs.len(),
        task_summary: outputs
            .iter()
            .map(|o| TaskSummary {
                task_name: o.step_name.clone().unwrap_or_default(),
                executor_type: o
                    .executor_type
                    .map(|t| t.to_string())
                    .unwrap_or_default(),
                executor_name: o.executor_name.clone().unwrap_or_default(),
            })
            .collect(),
    }
}

/// Outputs of a chained run plus the input the next step would have seen.
pub(crate) struct Chained {
    pub outputs: Vec<StepOutput>,
    pub input: StepInput,
}

/// Run `steps` in order, folding each step's outputs into the input of the next.
///
/// Steps that produce no outputs leave the chain untouched. The first error
/// stops the run; aliases already recorded are simply dropped with the input.
pub(crate) async fn run_steps(steps: &[Step], input: StepInput, ctx: &RunContext) -> Result<Chained> {
    let mut current = input;
    let mut collected = Vec::new();

    for (index, step) in steps.iter().enumerate() {
        let outputs = run_element(step, index, &current, ctx).await?;
        if outputs.is_empty() {
            debug!(step = %step.name(), "Step produced no output");
            continue;
        }

        let mut previous = current.previous_outputs.clone();
        previous.ingest(step.name(), index, &outputs);
        current = current.advance(&outputs, previous);
        collected.extend(outputs);
    }

    Ok(Chained {
        outputs: collected,
        input: current,
    })
}

/// Execute one element, bracketing it with task events.
pub(crate) async fn run_element(
    step: &Step,
    index: usize,
    input: &StepInput,
    ctx: &RunContext,
) -> Result<Vec<StepOutput>> {
    ctx.emit(WorkflowEvent::TaskStarted(TaskStartedEvent {
        run_id: ctx.run_id.clone(),
        workflow_name: ctx.workflow_name.clone(),
        sequence_name: ctx.sequence_name.clone(),
        task_name: step.name().to_string(),
        task_index: index,
        created_at: chrono::Utc::now().timestamp(),
    }))
    .await?;

    match step.execute(input, ctx).await {
        Ok(outputs) => {
            if !outputs.is_empty() {
                ctx.emit(task_completed(ctx, step.name(), index, &outputs)).await?;
            }
            Ok(outputs)
        }
        Err(StrandError::Cancelled) => Err(StrandError::Cancelled),
        Err(e) => {
            let _ = ctx
                .emit(WorkflowEvent::TaskError(TaskErrorEvent {
                    run_id: ctx.run_id.clone(),
                    workflow_name: ctx.workflow_name.clone(),
                    sequence_name: ctx.sequence_name.clone(),
                    task_name: step.name().to_string(),
                    task_index: index,
                    error: e.to_string(),
                    created_at: chrono::Utc::now().timestamp(),
                }))
                .await;
            Err(e)
        }
    }
}

fn task_completed(ctx: &RunContext, name: &str, index: usize, outputs: &[StepOutput]) -> WorkflowEvent {
    let mut media = Media::default();
    for output in outputs {
        media.extend(&output.media);
    }
    let primary = outputs.last();

    WorkflowEvent::TaskCompleted(TaskCompletedEvent {
        run_id: ctx.run_id.clone(),
        workflow_name: ctx.workflow_name.clone(),
        sequence_name: ctx.sequence_name.clone(),
        task_name: name.to_string(),
        task_index: index,
        content: primary.and_then(|o| o.content.clone()),
        content_type: primary.map(|o| o.content_type()).unwrap_or("str").to_string(),
        images: media.images,
        videos: media.videos,
        audio: media.audio,
        messages: primary
            .and_then(|o| o.response.as_ref())
            .map(|r| r.messages.clone())
            .unwrap_or_default(),
        metrics: primary.and_then(|o| o.metrics.clone()),
        task_responses: outputs.to_vec(),
        created_at: chrono::Utc::now().timestamp(),
    })
}
