use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrandError {
    // Executor errors
    #[error("Executor failed in step {step}: {message}")]
    Executor { step: String, message: String },

    #[error("Step timeout after {timeout_secs}s: {step}")]
    StepTimeout { step: String, timeout_secs: u64 },

    #[error("Input validation failed for step {step}: {message}")]
    InputValidation { step: String, message: String },

    #[error("Step configuration error: {0}")]
    StepConfig(String),

    // Control-flow errors
    #[error("Evaluator failed in {step}: {message}")]
    Evaluator { step: String, message: String },

    #[error("Router {router} selection failed: {message}")]
    RouterSelection { router: String, message: String },

    // Workflow resolution errors
    #[error("Sequence not found: {0}")]
    SequenceNotFound(String),

    #[error("Workflow {0} has no sequences")]
    NoSequences(String),

    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue error: {0}")]
    Queue(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StrandError {
    /// Wrap an error raised by a step's executor.
    pub fn executor(step: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Executor {
            step: step.into(),
            message: err.to_string(),
        }
    }

    /// Wrap an error raised by a user-supplied predicate or selector.
    pub fn evaluator(step: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Evaluator {
            step: step.into(),
            message: err.to_string(),
        }
    }

    /// Whether the task retry loop should try this error again.
    ///
    /// Validation and configuration failures are deterministic, so retrying them
    /// only burns attempts.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Executor { .. } | Self::StepTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, StrandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_display() {
        let e = StrandError::executor("research", "provider returned 503");
        assert_eq!(
            e.to_string(),
            "Executor failed in step research: provider returned 503"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StrandError::executor("a", "boom").is_retryable());
        assert!(StrandError::StepTimeout {
            step: "a".into(),
            timeout_secs: 5
        }
        .is_retryable());
        assert!(!StrandError::InputValidation {
            step: "a".into(),
            message: "missing topic".into()
        }
        .is_retryable());
        assert!(!StrandError::Cancelled.is_retryable());
    }
}
