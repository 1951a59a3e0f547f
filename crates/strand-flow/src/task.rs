use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use strand_core::error::{Result, StrandError};
use strand_core::io::{StepInput, StepOutput};
use strand_core::traits::{AgentExecutor, TeamExecutor};
use strand_core::types::ExecutorType;

use crate::context::RunContext;
use crate::retry::{Backoff, RetryPolicy};

/// A type-erased function executor.
pub type TaskFn =
    Arc<dyn Fn(StepInput) -> BoxFuture<'static, Result<FunctionOutput>> + Send + Sync>;

/// The one thing a task delegates its work to.
#[derive(Clone)]
pub enum Executor {
    Agent(Arc<dyn AgentExecutor>),
    Team(Arc<dyn TeamExecutor>),
    Function(TaskFn),
}

impl Executor {
    pub fn executor_type(&self) -> ExecutorType {
        match self {
            Self::Agent(_) => ExecutorType::Agent,
            Self::Team(_) => ExecutorType::Team,
            Self::Function(_) => ExecutorType::Function,
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(a) => f.debug_tuple("Agent").field(&a.name()).finish(),
            Self::Team(t) => f.debug_tuple("Team").field(&t.name()).finish(),
            Self::Function(_) => f.write_str("Function"),
        }
    }
}

/// What a function executor may return.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionOutput {
    /// Used as-is.
    Output(StepOutput),
    /// Becomes the content.
    Text(String),
    /// Content comes from the `content` key, else the whole map stringified.
    /// The map itself is kept as structured data.
    Map(Map<String, Value>),
    /// Stringified into the content.
    Other(Value),
}

impl FunctionOutput {
    pub fn into_step_output(self) -> StepOutput {
        match self {
            Self::Output(output) => output,
            Self::Text(text) => StepOutput::text(text),
            Self::Map(map) => {
                let content = match map.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => Value::Object(map.clone()).to_string(),
                };
                StepOutput::text(content).with_data(Value::Object(map))
            }
            Self::Other(value) => StepOutput::text(value.to_string()),
        }
    }
}

impl From<StepOutput> for FunctionOutput {
    fn from(output: StepOutput) -> Self {
        Self::Output(output)
    }
}

impl From<String> for FunctionOutput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for FunctionOutput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Map<String, Value>> for FunctionOutput {
    fn from(map: Map<String, Value>) -> Self {
        Self::Map(map)
    }
}

impl From<Value> for FunctionOutput {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => Self::Text(s),
            Value::Object(map) => Self::Map(map),
            other => Self::Other(other),
        }
    }
}

/// Semantic type of a declared input field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Bool,
    Object,
    Array,
    Any,
}

impl FieldType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Bool => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Bool => "bool",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn wrap_async<F, Fut, R, E>(step: String, f: F) -> TaskFn
where
    F: Fn(StepInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    R: Into<FunctionOutput>,
    E: fmt::Display,
{
    Arc::new(move |input: StepInput| -> BoxFuture<'static, Result<FunctionOutput>> {
        let fut = f(input);
        let step = step.clone();
        Box::pin(async move {
            fut.await
                .map(Into::into)
                .map_err(|e| StrandError::executor(step, e))
        })
    })
}

fn wrap_blocking<F, R, E>(step: String, f: F) -> TaskFn
where
    F: Fn(StepInput) -> std::result::Result<R, E> + Send + Sync + 'static,
    R: Into<FunctionOutput> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |input: StepInput| -> BoxFuture<'static, Result<FunctionOutput>> {
        let f = f.clone();
        let step = step.clone();
        Box::pin(async move {
            let result = tokio::task::spawn_blocking(move || f(input))
                .await
                .map_err(|e| StrandError::executor(&step, e))?;
            result
                .map(Into::into)
                .map_err(|e| StrandError::executor(step, e))
        })
    })
}

/// A named, schedulable unit wrapping exactly one executor.
///
/// Tasks are built once per workflow definition and executed once per run
/// (or once per iteration inside a loop). Apart from `retry_count` they keep
/// no state between executions.
#[derive(Debug)]
pub struct Task {
    name: String,
    task_id: String,
    description: Option<String>,
    executor: Executor,
    retry: RetryPolicy,
    skip_on_failure: bool,
    timeout_seconds: Option<u64>,
    strict_input_validation: bool,
    expected_input: BTreeMap<String, FieldType>,
    expected_output: Option<String>,
    retry_count: AtomicU32,
}

impl Task {
    fn with_executor(name: String, executor: Executor) -> Self {
        Self {
            name,
            task_id: Uuid::new_v4().to_string(),
            description: None,
            executor,
            retry: RetryPolicy::default(),
            skip_on_failure: false,
            timeout_seconds: None,
            strict_input_validation: false,
            expected_input: BTreeMap::new(),
            expected_output: None,
            retry_count: AtomicU32::new(0),
        }
    }

    pub fn agent(name: impl Into<String>, agent: Arc<dyn AgentExecutor>) -> Self {
        Self::with_executor(name.into(), Executor::Agent(agent))
    }

    pub fn team(name: impl Into<String>, team: Arc<dyn TeamExecutor>) -> Self {
        Self::with_executor(name.into(), Executor::Team(team))
    }

    /// A task backed by an async function.
    ///
    /// The function receives the full `StepInput`; its error type only needs
    /// `Display`, and is reported as an executor failure.
    pub fn function<F, Fut, R, E>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Into<FunctionOutput>,
        E: fmt::Display,
    {
        let name = name.into();
        let executor = Executor::Function(wrap_async(name.clone(), f));
        Self::with_executor(name, executor)
    }

    /// A task backed by a synchronous function run on the blocking pool.
    pub fn blocking_function<F, R, E>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepInput) -> std::result::Result<R, E> + Send + Sync + 'static,
        R: Into<FunctionOutput> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let name = name.into();
        let executor = Executor::Function(wrap_blocking(name.clone(), f));
        Self::with_executor(name, executor)
    }

    /// A task backed by a cheap, infallible closure run inline.
    pub fn from_fn<F, R>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&StepInput) -> R + Send + Sync + 'static,
        R: Into<FunctionOutput>,
    {
        let func: TaskFn = Arc::new(move |input: StepInput| -> BoxFuture<'static, Result<FunctionOutput>> {
            let output = f(&input).into();
            Box::pin(async move { Ok(output) })
        });
        Self::with_executor(name.into(), Executor::Function(func))
    }

    /// Start a builder that checks the executor count at `build()`.
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.retry.backoff = backoff;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_skip_on_failure(mut self, skip: bool) -> Self {
        self.skip_on_failure = skip;
        self
    }

    /// Bound every executor attempt to `seconds`.
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_strict_input_validation(mut self, strict: bool) -> Self {
        self.strict_input_validation = strict;
        self
    }

    /// Declare an input field this task expects to find in its input.
    pub fn expect_input(mut self, field: impl Into<String>, ty: FieldType) -> Self {
        self.expected_input.insert(field.into(), ty);
        self
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn executor_type(&self) -> ExecutorType {
        self.executor.executor_type()
    }

    /// Name of the agent or team, or the task's own name for functions.
    pub fn executor_name(&self) -> &str {
        match &self.executor {
            Executor::Agent(agent) => agent.name(),
            Executor::Team(team) => team.name(),
            Executor::Function(_) => &self.name,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn skips_on_failure(&self) -> bool {
        self.skip_on_failure
    }

    pub fn timeout_seconds(&self) -> Option<u64> {
        self.timeout_seconds
    }

    /// Failed attempts during the most recent execution.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    /// Run the task once, retrying its executor as the policy allows.
    pub async fn execute(&self, input: &StepInput, ctx: &RunContext) -> Result<StepOutput> {
        info!(step = %self.name, executor = %self.executor_type(), "Executing task");

        self.validate_input(input)?;
        self.retry_count.store(0, Ordering::Relaxed);

        let mut failures: u32 = 0;
        let err = loop {
            match self.attempt(input, ctx).await {
                Ok(output) => {
                    debug!(step = %self.name, retries = failures, "Task completed");
                    return Ok(output);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    failures += 1;
                    self.retry_count.store(failures, Ordering::Relaxed);
                    if failures > self.retry.max_retries {
                        break e;
                    }
                    let delay = self.retry.backoff.delay(failures - 1);
                    warn!(
                        step = %self.name,
                        attempt = failures,
                        max_attempts = self.retry.max_attempts(),
                        backoff_ms = delay.map(|d| d.as_millis() as u64).unwrap_or(0),
                        error = %e,
                        "Retrying task"
                    );
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        };

        if self.skip_on_failure {
            info!(step = %self.name, error = %err, "Task failed, skipping");
            let mut output = StepOutput::failed(err.to_string());
            output.content = Some(format!("Task {} failed but skipped", self.name));
            return Ok(output.identify(
                &self.name,
                Some(&self.task_id),
                self.executor_type(),
                self.executor_name(),
            ));
        }

        warn!(step = %self.name, attempts = failures, error = %err, "Task failed");
        Err(err)
    }

    async fn attempt(&self, input: &StepInput, ctx: &RunContext) -> Result<StepOutput> {
        let call = self.invoke(input, ctx);
        match self.timeout_seconds {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), call)
                .await
                .map_err(|_| StrandError::StepTimeout {
                    step: self.name.clone(),
                    timeout_secs: secs,
                })?,
            None => call.await,
        }
    }

    async fn invoke(&self, input: &StepInput, ctx: &RunContext) -> Result<StepOutput> {
        let output = match &self.executor {
            Executor::Agent(agent) => {
                let message = self.render_message(input);
                let response = agent
                    .run(message, ctx.executor_context(&self.name))
                    .await
                    .map_err(|e| self.executor_error(e))?;
                StepOutput::from_response(response)
            }
            Executor::Team(team) => {
                let message = self.render_message(input);
                let response = team
                    .run(message, ctx.executor_context(&self.name))
                    .await
                    .map_err(|e| self.executor_error(e))?;
                StepOutput::from_response(response)
            }
            Executor::Function(f) => f(input.clone()).await?.into_step_output(),
        };

        Ok(output.identify(
            &self.name,
            Some(&self.task_id),
            self.executor_type(),
            self.executor_name(),
        ))
    }

    fn executor_error(&self, e: StrandError) -> StrandError {
        if e.is_retryable() {
            e
        } else {
            StrandError::executor(&self.name, e)
        }
    }

    fn validate_input(&self, input: &StepInput) -> Result<()> {
        if self.expected_input.is_empty() {
            return Ok(());
        }

        let fields = input.fields();
        let problems: Vec<String> = self
            .expected_input
            .iter()
            .filter_map(|(key, ty)| match fields.get(key) {
                None => Some(format!("missing input '{}'", key)),
                Some(value) if !ty.matches(value) => Some(format!(
                    "input '{}' should be {}, got {}",
                    key,
                    ty,
                    json_type_name(value)
                )),
                Some(_) => None,
            })
            .collect();

        if problems.is_empty() {
            return Ok(());
        }

        let message = problems.join("; ");
        if self.strict_input_validation {
            return Err(StrandError::InputValidation {
                step: self.name.clone(),
                message,
            });
        }
        warn!(step = %self.name, problems = %message, "Input validation failed, continuing");
        Ok(())
    }

    /// The message handed to an agent or team.
    ///
    /// A bare message passes through verbatim. Once earlier steps have
    /// produced outputs, every input field is listed under the task's
    /// description and expected-output hint.
    pub fn render_message(&self, input: &StepInput) -> String {
        let fields = input.fields();
        if fields.len() == 1 {
            return input.message_as_string();
        }

        let mut parts = Vec::new();
        if let Some(description) = &self.description {
            parts.push(format!("Task: {}", description));
        }
        parts.push("Inputs:".to_string());
        parts.push(format!("- message: {}", input.message_as_string()));

        let mut rest: Vec<(&String, &Value)> =
            fields.iter().filter(|(k, _)| k.as_str() != "message").collect();
        rest.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in rest {
            let display = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            parts.push(format!("- {}: {}", key, display));
        }

        if let Some(expected) = &self.expected_output {
            parts.push(format!("\nExpected output: {}", expected));
        }
        parts.join("\n")
    }
}

/// Builds a `Task` from optional executor slots, rejecting zero or several.
pub struct TaskBuilder {
    name: String,
    description: Option<String>,
    agent: Option<Arc<dyn AgentExecutor>>,
    team: Option<Arc<dyn TeamExecutor>>,
    function: Option<TaskFn>,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            agent: None,
            team: None,
            function: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn agent(mut self, agent: Arc<dyn AgentExecutor>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn team(mut self, team: Arc<dyn TeamExecutor>) -> Self {
        self.team = Some(team);
        self
    }

    pub fn function<F, Fut, R, E>(mut self, f: F) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Into<FunctionOutput>,
        E: fmt::Display,
    {
        self.function = Some(wrap_async(self.name.clone(), f));
        self
    }

    pub fn build(self) -> Result<Task> {
        let mut executors: Vec<Executor> = Vec::new();
        if let Some(agent) = self.agent {
            executors.push(Executor::Agent(agent));
        }
        if let Some(team) = self.team {
            executors.push(Executor::Team(team));
        }
        if let Some(function) = self.function {
            executors.push(Executor::Function(function));
        }

        if executors.len() != 1 {
            return Err(StrandError::StepConfig(format!(
                "task '{}' needs exactly one executor (agent, team or function), got {}",
                self.name,
                executors.len()
            )));
        }

        let mut task = Task::with_executor(self.name, executors.remove(0));
        task.description = self.description;
        Ok(task)
    }
}
