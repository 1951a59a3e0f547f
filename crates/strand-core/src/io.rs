//! Data carried into and out of every step.
//!
//! `StepInput` is what a step receives: the run's primary message, the
//! accumulated `PreviousOutputs` of the run so far, media collected along the
//! way, and a handle to the shared session state. `StepOutput` is what a step
//! returns.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{ExecutorResponse, ExecutorType, Media};

/// Output data from a step execution.
///
/// A failed output (`success == false`) may still carry content, e.g. the
/// marker left by a task configured with `skip_on_failure`. Check `success`
/// and `error` before treating `content` as authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_type: Option<ExecutorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_name: Option<String>,

    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Raw agent/team response, kept for messages and metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ExecutorResponse>,
    #[serde(default)]
    pub media: Media,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,

    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,

    /// Per-branch outputs of a composite (parallel) step, in branch order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StepOutput>,
}

fn default_success() -> bool {
    true
}

impl Default for StepOutput {
    fn default() -> Self {
        Self {
            step_name: None,
            step_id: None,
            executor_type: None,
            executor_name: None,
            content: None,
            data: None,
            response: None,
            media: Media::default(),
            metrics: None,
            success: true,
            error: None,
            metadata: Map::new(),
            children: Vec::new(),
        }
    }
}

impl StepOutput {
    /// A successful output with text content.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// A failed output carrying an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Build an output from an agent or team response.
    pub fn from_response(response: ExecutorResponse) -> Self {
        Self {
            content: response.content.clone(),
            data: response.data.clone(),
            media: response.media.clone(),
            metrics: response.metrics.clone(),
            response: Some(response),
            ..Default::default()
        }
    }

    /// Collapse several outputs into one aggregate.
    ///
    /// The aggregate's content is the last non-empty child content, it succeeds
    /// only if every child succeeded, and its media is the union of the
    /// children's media. A single output is returned as-is.
    pub fn collapse(name: &str, executor_type: ExecutorType, mut outputs: Vec<StepOutput>) -> Self {
        if outputs.len() == 1 {
            return outputs.remove(0);
        }
        let mut aggregate = Self::aggregate(outputs);
        aggregate.step_name = Some(name.to_string());
        aggregate.executor_type = Some(executor_type);
        aggregate.executor_name = Some(name.to_string());
        aggregate
    }

    /// Join outputs into one composite that keeps every child in order.
    pub fn aggregate(children: Vec<StepOutput>) -> Self {
        let content = children.iter().rev().find_map(|c| c.content.clone());
        let success = children.iter().all(|c| c.success);
        let errors: Vec<String> = children
            .iter()
            .filter_map(|c| {
                c.error.as_ref().map(|e| match &c.step_name {
                    Some(name) => format!("{}: {}", name, e),
                    None => e.clone(),
                })
            })
            .collect();
        let mut media = Media::default();
        for child in &children {
            media.extend(&child.media);
        }

        Self {
            content,
            media,
            success,
            error: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
            children,
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_media(mut self, media: Media) -> Self {
        self.media = media;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Stamp identity fields unless the producer already set them.
    pub fn identify(
        mut self,
        step_name: &str,
        step_id: Option<&str>,
        executor_type: ExecutorType,
        executor_name: &str,
    ) -> Self {
        self.step_name.get_or_insert_with(|| step_name.to_string());
        if let Some(id) = step_id {
            self.step_id.get_or_insert_with(|| id.to_string());
        }
        self.executor_type.get_or_insert(executor_type);
        self.executor_name.get_or_insert_with(|| executor_name.to_string());
        self
    }

    /// Content type label used on the event wire.
    pub fn content_type(&self) -> &'static str {
        if self.content.is_none() && self.data.is_some() {
            "json"
        } else {
            "str"
        }
    }
}

/// Run-scoped map of aliases to values produced by earlier steps.
///
/// Keys are only ever added. When a step named `name` at position `i`
/// completes, its last output is stored under all of:
///
/// - content: `name`, `{name}_output`, `task_{i}_output`, `output`, `result`
/// - structured data: `{name}_data`, `data`
/// - media: `{name}_images` / `images`, `{name}_videos` / `videos`,
///   `{name}_audio` / `audio`
///
/// Outputs of nested steps that carry their own `step_name` are also stored
/// under that name and `{step_name}_output`, so later steps can reach into a
/// branch or loop body by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreviousOutputs {
    data: HashMap<String, Value>,
    #[serde(default)]
    outputs: Vec<StepOutput>,
}

impl PreviousOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by alias.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Set a value directly.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Every output recorded so far, in completion order.
    pub fn outputs(&self) -> &[StepOutput] {
        &self.outputs
    }

    /// The most recently recorded output with the given step name.
    pub fn step_output(&self, step_name: &str) -> Option<&StepOutput> {
        self.outputs
            .iter()
            .rev()
            .find(|o| o.step_name.as_deref() == Some(step_name))
    }

    /// Fold the outputs of the step at `index` into the map.
    ///
    /// A step that produced no outputs (a condition that evaluated false)
    /// leaves the map untouched.
    pub fn ingest(&mut self, name: &str, index: usize, outputs: &[StepOutput]) {
        let Some(primary) = outputs.last() else {
            return;
        };

        if let Some(content) = &primary.content {
            let value = Value::String(content.clone());
            for key in [
                name.to_string(),
                format!("{}_output", name),
                format!("task_{}_output", index),
                "output".to_string(),
                "result".to_string(),
            ] {
                self.data.insert(key, value.clone());
            }
        }

        if let Some(data) = &primary.data {
            self.data.insert(format!("{}_data", name), data.clone());
            self.data.insert("data".to_string(), data.clone());
        }

        for (suffix, artifacts) in [
            ("images", &primary.media.images),
            ("videos", &primary.media.videos),
            ("audio", &primary.media.audio),
        ] {
            if artifacts.is_empty() {
                continue;
            }
            let value = serde_json::to_value(artifacts).unwrap_or(Value::Null);
            self.data.insert(format!("{}_{}", name, suffix), value.clone());
            self.data.insert(suffix.to_string(), value);
        }

        for output in outputs.iter().flat_map(|o| std::iter::once(o).chain(o.children.iter())) {
            match (&output.step_name, &output.content) {
                (Some(step_name), Some(content)) if step_name != name => {
                    let value = Value::String(content.clone());
                    self.data.insert(step_name.clone(), value.clone());
                    self.data.insert(format!("{}_output", step_name), value);
                }
                _ => {}
            }
        }

        self.outputs.extend(outputs.iter().cloned());
    }

    /// Get the underlying alias map.
    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }
}

/// Shared mutable blackboard for one workflow session.
///
/// Cloning yields another handle to the same map. Runs against one session are
/// serialized by the workflow, so within a run the only concurrent writers are
/// parallel branches, which the lock keeps consistent.
#[derive(Debug, Clone, Default)]
pub struct SessionState(Arc<RwLock<Map<String, Value>>>);

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(Arc::new(RwLock::new(map)))
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let guard = self.0.read().unwrap_or_else(|e| e.into_inner());
        guard.get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        let mut guard = self.0.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut guard = self.0.write().unwrap_or_else(|e| e.into_inner());
        guard.remove(key)
    }

    /// Mutate the map in place under the write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        let mut guard = self.0.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Insert each default whose key is not already present.
    pub fn seed(&self, defaults: &Map<String, Value>) {
        self.update(|map| {
            for (k, v) in defaults {
                map.entry(k.clone()).or_insert_with(|| v.clone());
            }
        });
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Map<String, Value> {
        let guard = self.0.read().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }
}

/// Input data for a step execution.
#[derive(Debug, Clone, Default)]
pub struct StepInput {
    /// The end-user message for this run (plain text or structured JSON).
    pub message: Value,
    /// Content of the nearest preceding output, if any.
    pub previous_step_content: Option<String>,
    pub previous_outputs: PreviousOutputs,
    pub media: Media,
    pub session_state: SessionState,
}

impl StepInput {
    pub fn new(message: impl Into<Value>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_session_state(mut self, state: SessionState) -> Self {
        self.session_state = state;
        self
    }

    pub fn with_media(mut self, media: Media) -> Self {
        self.media = media;
        self
    }

    /// The message rendered as text; structured messages become pretty JSON.
    pub fn message_as_string(&self) -> String {
        match &self.message {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }

    pub fn get_step_output(&self, step_name: &str) -> Option<&StepOutput> {
        self.previous_outputs.step_output(step_name)
    }

    pub fn get_step_content(&self, step_name: &str) -> Option<&str> {
        self.get_step_output(step_name)
            .and_then(|o| o.content.as_deref())
    }

    pub fn get_last_step_content(&self) -> Option<&str> {
        self.previous_outputs
            .outputs()
            .last()
            .and_then(|o| o.content.as_deref())
    }

    /// Concatenated content of all previous outputs, each under a header.
    pub fn get_all_previous_content(&self) -> String {
        self.previous_outputs
            .outputs()
            .iter()
            .filter_map(|o| {
                let content = o.content.as_deref()?;
                let name = o.step_name.as_deref().unwrap_or("step");
                Some(format!("=== {} ===\n{}", name, content))
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Flat view of every input field: `message` plus all previous-output aliases.
    pub fn fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("message".to_string(), self.message.clone());
        for (k, v) in self.previous_outputs.data() {
            fields.insert(k.clone(), v.clone());
        }
        fields
    }

    /// Derive the input for the next step after `outputs` were produced.
    pub fn advance(&self, outputs: &[StepOutput], previous_outputs: PreviousOutputs) -> Self {
        let mut media = self.media.clone();
        for output in outputs {
            media.extend(&output.media);
        }
        let previous_step_content = outputs
            .iter()
            .rev()
            .find_map(|o| o.content.clone())
            .or_else(|| self.previous_step_content.clone());

        Self {
            message: self.message.clone(),
            previous_step_content,
            previous_outputs,
            media,
            session_state: self.session_state.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaArtifact;
    use serde_json::json;

    fn named(name: &str, content: &str) -> StepOutput {
        let mut out = StepOutput::text(content);
        out.step_name = Some(name.to_string());
        out
    }

    #[test]
    fn test_ingest_registers_every_alias() {
        let mut prev = PreviousOutputs::new();
        prev.ingest("research", 0, &[named("research", "X")]);

        for key in ["research", "research_output", "task_0_output", "output", "result"] {
            assert_eq!(prev.get_str(key), Some("X"), "missing alias {}", key);
        }
    }

    #[test]
    fn test_ingest_keeps_earlier_keys() {
        let mut prev = PreviousOutputs::new();
        prev.ingest("a", 0, &[named("a", "first")]);
        prev.ingest("b", 1, &[named("b", "second")]);

        assert_eq!(prev.get_str("a"), Some("first"));
        assert_eq!(prev.get_str("task_0_output"), Some("first"));
        assert_eq!(prev.get_str("b"), Some("second"));
        assert_eq!(prev.get_str("output"), Some("second"));
        assert_eq!(prev.get_str("result"), Some("second"));
    }

    #[test]
    fn test_ingest_empty_is_noop() {
        let mut prev = PreviousOutputs::new();
        prev.ingest("gate", 1, &[]);
        assert!(prev.is_empty());
        assert!(prev.outputs().is_empty());
    }

    #[test]
    fn test_ingest_data_and_media() {
        let mut prev = PreviousOutputs::new();
        let mut media = Media::default();
        media.push(MediaArtifact::image("https://example.com/chart.png"));
        let out = named("chart", "done")
            .with_data(json!({"points": 3}))
            .with_media(media);
        prev.ingest("chart", 0, &[out]);

        assert_eq!(prev.get("chart_data"), Some(&json!({"points": 3})));
        assert_eq!(prev.get("data"), Some(&json!({"points": 3})));
        assert!(prev.get("chart_images").unwrap().is_array());
        assert!(prev.get("images").unwrap().is_array());
        assert!(!prev.contains_key("videos"));
    }

    #[test]
    fn test_ingest_registers_nested_step_names() {
        let mut prev = PreviousOutputs::new();
        let outputs = vec![named("tech", "Tech content"), named("summary", "Summary")];
        prev.ingest("router", 2, &outputs);

        assert_eq!(prev.get_str("router"), Some("Summary"));
        assert_eq!(prev.get_str("tech"), Some("Tech content"));
        assert_eq!(prev.get_str("tech_output"), Some("Tech content"));
    }

    #[test]
    fn test_aggregate_success_and_errors() {
        let mut bad = StepOutput::failed("boom");
        bad.step_name = Some("b".into());
        let agg = StepOutput::aggregate(vec![named("a", "ok"), bad]);
        assert!(!agg.success);
        assert_eq!(agg.error.as_deref(), Some("b: boom"));
        assert_eq!(agg.content.as_deref(), Some("ok"));
        assert_eq!(agg.children.len(), 2);
    }

    #[test]
    fn test_session_state_seed_does_not_overwrite() {
        let state = SessionState::new();
        state.set("count", json!(5));
        let mut defaults = Map::new();
        defaults.insert("count".into(), json!(0));
        defaults.insert("items".into(), json!([]));
        state.seed(&defaults);

        assert_eq!(state.get("count"), Some(json!(5)));
        assert_eq!(state.get("items"), Some(json!([])));
    }

    #[test]
    fn test_session_state_handles_share_storage() {
        let state = SessionState::new();
        let other = state.clone();
        other.set("k", json!("v"));
        assert_eq!(state.get("k"), Some(json!("v")));
    }

    #[test]
    fn test_step_input_accessors() {
        let mut prev = PreviousOutputs::new();
        prev.ingest("research", 0, &[named("research", "R")]);
        prev.ingest("analysis", 1, &[named("analysis", "A")]);
        let input = StepInput {
            message: json!("topic"),
            previous_outputs: prev,
            ..Default::default()
        };

        assert_eq!(input.get_step_content("research"), Some("R"));
        assert_eq!(input.get_last_step_content(), Some("A"));
        assert_eq!(
            input.get_all_previous_content(),
            "=== research ===\nR\n\n=== analysis ===\nA"
        );
    }

    #[test]
    fn test_message_as_string_structured() {
        let input = StepInput::new(json!({"topic": "AI"}));
        assert!(input.message_as_string().contains("\"topic\": \"AI\""));
        assert_eq!(StepInput::new("plain").message_as_string(), "plain");
    }
}
