use std::io::Write;
use std::sync::Arc;

use strand_core::config::{AppConfig, BackoffConfig};
use strand_core::error::StrandError;
use strand_flow::{Backoff, RetryPolicy};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
event_buffer = 8
workspace = "/tmp/strand-test"

[retry]
max_retries = 2

[retry.backoff]
type = "exponential"
initial_ms = 100
max_ms = 1000
jitter = false

[storage]
db_path = "/tmp/strand-test/custom.db"

[queue]
path = "/tmp/strand-test/queue.json"

[log]
level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.event_buffer, 8);
    assert_eq!(config.retry.max_retries, 2);
    assert_eq!(
        config.db_path(),
        std::path::PathBuf::from("/tmp/strand-test/custom.db")
    );
    assert_eq!(
        config.queue_path(),
        std::path::PathBuf::from("/tmp/strand-test/queue.json")
    );

    let log = config.log.clone().expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 3);
    assert_eq!(
        config.log_dir(),
        std::path::PathBuf::from("/tmp/strand-test/logs")
    );

    let policy = RetryPolicy::from_config(&config.retry);
    assert_eq!(policy.max_attempts(), 3);
    assert!(matches!(policy.backoff, Backoff::Exponential { jitter: false, .. }));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("STRAND_TEST_WORKSPACE", "/tmp/from-env");

    let toml_content = r#"
[engine]
workspace = "${STRAND_TEST_WORKSPACE}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.workspace_dir(), std::path::PathBuf::from("/tmp/from-env"));
    assert_eq!(
        config.db_path(),
        std::path::PathBuf::from("/tmp/from-env/sessions.db")
    );

    std::env::remove_var("STRAND_TEST_WORKSPACE");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.event_buffer, 64);
    assert_eq!(config.engine.workspace, "~/.strand");
    assert_eq!(config.retry.max_retries, 3);
    assert_eq!(config.retry.backoff, BackoffConfig::None);
    assert!(config.storage.db_path.is_none());
    assert!(config.queue.path.is_none());
    assert!(config.log.is_none());
}

#[test]
fn test_missing_file_is_not_found() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = AppConfig::load(&dir.path().join("nope.toml")).unwrap_err();
    assert!(matches!(err, StrandError::ConfigNotFound(_)));
}

#[tokio::test]
async fn test_config_drives_workflow_logging() {
    let (dir, config) = strand_test_utils::temp_workspace();
    let wf = strand_flow::Workflow::new("wf")
        .with_config(&config)
        .with_sequence(strand_flow::Sequence::new(
            "main",
            vec![strand_flow::Task::from_fn("echo", |i: &strand_core::StepInput| i.message_as_string()).into()],
        ));
    let wf = Arc::new(wf);

    wf.run(strand_flow::RunRequest::new("hi").with_session("cfg"))
        .await
        .expect("run");

    let session_logs = dir.path().join("logs").join("cfg");
    let files: Vec<_> = std::fs::read_dir(&session_logs)
        .expect("log dir exists")
        .collect();
    assert_eq!(files.len(), 1);
}
