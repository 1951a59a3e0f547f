use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Persisted record of one workflow session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSession {
    pub session_id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Serialized runs, oldest first.
    #[serde(default)]
    pub runs: Vec<Value>,
    /// Holds `session_name` and `session_state`.
    #[serde(default)]
    pub session_data: Map<String, Value>,
    #[serde(default)]
    pub workflow_data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSession {
    pub fn new(session_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            workflow_id: workflow_id.into(),
            workflow_name: None,
            user_id: None,
            runs: Vec::new(),
            session_data: Map::new(),
            workflow_data: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn session_name(&self) -> Option<&str> {
        self.session_data.get("session_name").and_then(|v| v.as_str())
    }

    pub fn set_session_name(&mut self, name: impl Into<String>) {
        self.session_data
            .insert("session_name".to_string(), Value::String(name.into()));
    }

    /// The persisted session state, if any was saved.
    pub fn session_state(&self) -> Option<&Map<String, Value>> {
        self.session_data
            .get("session_state")
            .and_then(|v| v.as_object())
    }

    pub fn set_session_state(&mut self, state: Map<String, Value>) {
        self.session_data
            .insert("session_state".to_string(), Value::Object(state));
    }
}
