use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrandError};

/// Top-level Strand configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the bounded channel between a running sequence and its consumer.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
            workspace: default_workspace(),
        }
    }
}

fn default_event_buffer() -> usize { 64 }
fn default_workspace() -> String { "~/.strand".to_string() }

/// Task-level retry defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffConfig::default(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }

/// Delay between retry attempts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Retry immediately.
    #[default]
    None,
    /// Wait the same delay before every retry.
    Fixed { delay_ms: u64 },
    /// Double the delay each attempt, capped at `max_ms`.
    Exponential {
        #[serde(default = "default_initial_backoff")]
        initial_ms: u64,
        #[serde(default = "default_max_backoff")]
        max_ms: u64,
        #[serde(default)]
        jitter: bool,
    },
}

fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database for workflow sessions. Default: <workspace>/sessions.db
    #[serde(default)]
    pub db_path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// JSON file backing the deferred-run queue. Default: <workspace>/workflow_queue.json
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { path: None }
    }
}

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = workflow events only, 2 = plus task results, 3 = everything (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: None,
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StrandError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        toml::from_str(&expanded).map_err(|e| StrandError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    pub fn db_path(&self) -> PathBuf {
        match &self.storage.db_path {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("sessions.db"),
        }
    }

    pub fn queue_path(&self) -> PathBuf {
        match &self.queue.path {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("workflow_queue.json"),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        match self.log.as_ref().and_then(|l| l.log_dir.as_deref()) {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("logs"),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.engine.event_buffer, 64);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.backoff, BackoffConfig::None);
        assert!(config.log.is_none());
    }

    #[test]
    fn test_backoff_variants() {
        let config = AppConfig::parse(
            r#"
[retry]
max_retries = 5

[retry.backoff]
type = "exponential"
initial_ms = 200
jitter = true
"#,
        )
        .unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(
            config.retry.backoff,
            BackoffConfig::Exponential {
                initial_ms: 200,
                max_ms: 30000,
                jitter: true
            }
        );

        let fixed = AppConfig::parse("[retry.backoff]\ntype = \"fixed\"\ndelay_ms = 50\n").unwrap();
        assert_eq!(fixed.retry.backoff, BackoffConfig::Fixed { delay_ms: 50 });
    }

    #[test]
    fn test_explicit_paths_override_workspace() {
        let config = AppConfig::parse(
            r#"
[engine]
workspace = "/srv/strand"

[queue]
path = "/tmp/q.json"
"#,
        )
        .unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/srv/strand/sessions.db"));
        assert_eq!(config.queue_path(), PathBuf::from("/tmp/q.json"));
        assert_eq!(config.log_dir(), PathBuf::from("/srv/strand/logs"));
    }

    #[test]
    fn test_unset_env_var_is_kept() {
        let out = expand_env_vars("path = \"${STRAND_SURELY_UNSET_VAR}\"");
        assert_eq!(out, "path = \"${STRAND_SURELY_UNSET_VAR}\"");
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = AppConfig::parse("[engine\nevent_buffer = 1").unwrap_err();
        assert!(matches!(err, StrandError::Config(_)));
    }
}
