//! Mock executors and fixtures shared by strand tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use strand_core::config::AppConfig;
use strand_core::error::{Result, StrandError};
use strand_core::traits::{AgentExecutor, ExecutorContext, TeamExecutor};
use strand_core::types::ExecutorResponse;

/// Agent that echoes `"{name}: {message}"`.
pub struct MockAgent {
    name: String,
    delay: Option<Duration>,
    calls: AtomicUsize,
    messages: Mutex<Vec<String>>,
}

impl MockAgent {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: None,
            calls: AtomicUsize::new(0),
            messages: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every message received, in call order.
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl AgentExecutor for MockAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, message: String, _ctx: ExecutorContext) -> BoxFuture<'_, Result<ExecutorResponse>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.messages.lock().unwrap().push(message.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(ExecutorResponse::text(format!("{}: {}", self.name, message)))
        })
    }
}

/// Agent that fails a fixed number of times, then succeeds.
pub struct FlakyAgent {
    name: String,
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyAgent {
    pub fn new(name: &str, failures: usize) -> Self {
        Self {
            name: name.to_string(),
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AgentExecutor for FlakyAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, message: String, _ctx: ExecutorContext) -> BoxFuture<'_, Result<ExecutorResponse>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(StrandError::executor(
                    &self.name,
                    format!("transient failure {}/{}", call, self.failures),
                ));
            }
            Ok(ExecutorResponse::text(format!("{}: {}", self.name, message)))
        })
    }
}

/// Agent that always fails with the same message.
pub struct FailingAgent {
    name: String,
    message: String,
    calls: AtomicUsize,
}

impl FailingAgent {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AgentExecutor for FailingAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _message: String, _ctx: ExecutorContext) -> BoxFuture<'_, Result<ExecutorResponse>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StrandError::executor(&self.name, &self.message))
        })
    }
}

/// Team whose answer lists its members.
pub struct MockTeam {
    name: String,
    members: Vec<String>,
    calls: AtomicUsize,
}

impl MockTeam {
    pub fn new(name: &str, members: Vec<&str>) -> Self {
        Self {
            name: name.to_string(),
            members: members.into_iter().map(String::from).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TeamExecutor for MockTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, message: String, _ctx: ExecutorContext) -> BoxFuture<'_, Result<ExecutorResponse>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutorResponse::text(format!(
                "{} [{}]: {}",
                self.name,
                self.members.join(", "),
                message
            ))
            .with_data(serde_json::json!({ "members": self.members })))
        })
    }

    fn members(&self) -> Vec<String> {
        self.members.clone()
    }
}

/// Config rooted at `workspace`, with run logging enabled.
pub fn test_config(workspace: &Path) -> AppConfig {
    let toml = format!(
        "[engine]\nworkspace = \"{}\"\nevent_buffer = 16\n\n[log]\nlevel = 3\n",
        workspace.display()
    );
    AppConfig::parse(&toml).expect("test config parses")
}

/// Write `contents` to `name` inside `dir` and return the path.
pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write fixture");
    path
}

/// A temporary workspace directory with a matching config.
pub fn temp_workspace() -> (tempfile::TempDir, AppConfig) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = test_config(dir.path());
    (dir, config)
}
