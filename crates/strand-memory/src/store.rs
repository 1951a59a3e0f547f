use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::session::WorkflowSession;
use strand_core::traits::WorkflowStore;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS workflow_sessions (
        session_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        workflow_name TEXT,
        user_id TEXT,
        runs TEXT NOT NULL DEFAULT '[]',
        session_data TEXT NOT NULL DEFAULT '{}',
        workflow_data TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_workflow_sessions_workflow
        ON workflow_sessions(workflow_id, updated_at);";

const SELECT_COLUMNS: &str = "SELECT session_id, workflow_id, workflow_name, user_id, runs,
        session_data, workflow_data, created_at, updated_at
     FROM workflow_sessions";

/// SQLite-backed store for workflow sessions and their runs.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StrandError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| StrandError::Database(e.to_string()))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StrandError::Database(e.to_string()))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| StrandError::Database(e.to_string()))?;

        debug!(path = %path.display(), "Session store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| StrandError::Database(e.to_string()))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| StrandError::Database(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

type SessionRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
    String,
    String,
);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn parse_ts(ts: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_map(raw: &str) -> Map<String, Value> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn into_session(row: SessionRow) -> WorkflowSession {
    let (
        session_id,
        workflow_id,
        workflow_name,
        user_id,
        runs,
        session_data,
        workflow_data,
        created_at,
        updated_at,
    ) = row;

    WorkflowSession {
        session_id,
        workflow_id,
        workflow_name,
        user_id,
        runs: serde_json::from_str(&runs).unwrap_or_default(),
        session_data: parse_map(&session_data),
        workflow_data: parse_map(&workflow_data),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    }
}

fn load(conn: &Connection, session_id: &str) -> Result<Option<WorkflowSession>> {
    let row = conn
        .query_row(
            &format!("{} WHERE session_id = ?1", SELECT_COLUMNS),
            params![session_id],
            read_row,
        )
        .optional()
        .map_err(|e| StrandError::Database(e.to_string()))?;

    Ok(row.map(into_session))
}

/// Insert the session, or update everything but `runs` and `created_at` if it exists.
fn upsert(conn: &Connection, session: &WorkflowSession) -> Result<()> {
    let runs = serde_json::to_string(&session.runs)?;
    let session_data = serde_json::to_string(&session.session_data)?;
    let workflow_data = serde_json::to_string(&session.workflow_data)?;

    conn.execute(
        "INSERT INTO workflow_sessions
            (session_id, workflow_id, workflow_name, user_id, runs,
             session_data, workflow_data, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(session_id) DO UPDATE SET
            workflow_id = excluded.workflow_id,
            workflow_name = excluded.workflow_name,
            user_id = excluded.user_id,
            session_data = excluded.session_data,
            workflow_data = excluded.workflow_data,
            updated_at = excluded.updated_at",
        params![
            session.session_id,
            session.workflow_id,
            session.workflow_name,
            session.user_id,
            runs,
            session_data,
            workflow_data,
            session.created_at.to_rfc3339(),
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| StrandError::Database(e.to_string()))?;

    Ok(())
}

impl WorkflowStore for SqliteSessionStore {
    fn read_session(&self, session_id: &str) -> BoxFuture<'_, Result<Option<WorkflowSession>>> {
        let session_id = session_id.to_string();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StrandError::Database(e.to_string()))?;

            load(&conn, &session_id)
        })
    }

    fn upsert_session(&self, session: &WorkflowSession) -> BoxFuture<'_, Result<()>> {
        let session = session.clone();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StrandError::Database(e.to_string()))?;

            upsert(&conn, &session)
        })
    }

    fn append_run(&self, session: &WorkflowSession, run: Value) -> BoxFuture<'_, Result<()>> {
        let session = session.clone();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StrandError::Database(e.to_string()))?;

            upsert(&conn, &session)?;

            let existing: String = conn
                .query_row(
                    "SELECT runs FROM workflow_sessions WHERE session_id = ?1",
                    params![session.session_id],
                    |row| row.get(0),
                )
                .map_err(|e| StrandError::Database(e.to_string()))?;

            // Corrupt history fails the append.
            let mut runs: Vec<Value> = serde_json::from_str(&existing)?;
            runs.push(run);

            conn.execute(
                "UPDATE workflow_sessions SET runs = ?1, updated_at = ?2 WHERE session_id = ?3",
                params![
                    serde_json::to_string(&runs)?,
                    Utc::now().to_rfc3339(),
                    session.session_id
                ],
            )
            .map_err(|e| StrandError::Database(e.to_string()))?;

            debug!(session_id = %session.session_id, runs = runs.len(), "Run persisted");
            Ok(())
        })
    }

    fn list_sessions(
        &self,
        workflow_id: Option<&str>,
    ) -> BoxFuture<'_, Result<Vec<WorkflowSession>>> {
        let workflow_id = workflow_id.map(|s| s.to_string());

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StrandError::Database(e.to_string()))?;

            let sql = match workflow_id {
                Some(_) => format!(
                    "{} WHERE workflow_id = ?1 ORDER BY updated_at DESC",
                    SELECT_COLUMNS
                ),
                None => format!("{} ORDER BY updated_at DESC", SELECT_COLUMNS),
            };

            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| StrandError::Database(e.to_string()))?;

            let rows = match &workflow_id {
                Some(id) => stmt.query_map(params![id], read_row),
                None => stmt.query_map([], read_row),
            }
            .map_err(|e| StrandError::Database(e.to_string()))?;

            let mut sessions = Vec::new();
            for row in rows {
                let row = row.map_err(|e| StrandError::Database(e.to_string()))?;
                sessions.push(into_session(row));
            }

            Ok(sessions)
        })
    }

    fn rename_session(&self, session_id: &str, name: &str) -> BoxFuture<'_, Result<bool>> {
        let session_id = session_id.to_string();
        let name = name.to_string();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StrandError::Database(e.to_string()))?;

            let Some(mut session) = load(&conn, &session_id)? else {
                return Ok(false);
            };
            session.set_session_name(name);
            upsert(&conn, &session)?;
            Ok(true)
        })
    }

    fn delete_session(&self, session_id: &str) -> BoxFuture<'_, Result<bool>> {
        let session_id = session_id.to_string();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StrandError::Database(e.to_string()))?;

            let deleted = conn
                .execute(
                    "DELETE FROM workflow_sessions WHERE session_id = ?1",
                    params![session_id],
                )
                .map_err(|e| StrandError::Database(e.to_string()))?;

            Ok(deleted > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_run_creates_session() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let session = WorkflowSession::new("s1", "wf1");

        store
            .append_run(&session, json!({"run_id": "r1", "content": "hello"}))
            .await
            .unwrap();
        store
            .append_run(&session, json!({"run_id": "r2"}))
            .await
            .unwrap();

        let loaded = store.read_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.workflow_id, "wf1");
        assert_eq!(loaded.runs.len(), 2);
        assert_eq!(loaded.runs[0]["run_id"], "r1");
        assert_eq!(loaded.runs[1]["run_id"], "r2");
    }

    #[tokio::test]
    async fn test_append_run_refuses_to_overwrite_corrupt_history() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let session = WorkflowSession::new("s1", "wf1");
        store.append_run(&session, json!({"run_id": "r1"})).await.unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute("UPDATE workflow_sessions SET runs = 'not json' WHERE session_id = 's1'", [])
            .unwrap();

        let err = store.append_run(&session, json!({"run_id": "r2"})).await.unwrap_err();
        assert!(matches!(err, StrandError::Json(_)));

        let raw: String = store
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT runs FROM workflow_sessions WHERE session_id = 's1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(raw, "not json");
    }

    #[tokio::test]
    async fn test_upsert_keeps_runs() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let mut session = WorkflowSession::new("s1", "wf1");
        store.append_run(&session, json!({"run_id": "r1"})).await.unwrap();

        let mut state = Map::new();
        state.insert("count".into(), json!(2));
        session.set_session_state(state);
        store.upsert_session(&session).await.unwrap();

        let loaded = store.read_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.runs.len(), 1);
        assert_eq!(loaded.session_state().unwrap().get("count"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_list_filters_by_workflow() {
        let store = SqliteSessionStore::in_memory().unwrap();
        store.upsert_session(&WorkflowSession::new("a", "wf1")).await.unwrap();
        store.upsert_session(&WorkflowSession::new("b", "wf2")).await.unwrap();
        store.upsert_session(&WorkflowSession::new("c", "wf1")).await.unwrap();

        assert_eq!(store.list_sessions(None).await.unwrap().len(), 3);
        let wf1 = store.list_sessions(Some("wf1")).await.unwrap();
        assert_eq!(wf1.len(), 2);
        assert!(wf1.iter().all(|s| s.workflow_id == "wf1"));
    }

    #[tokio::test]
    async fn test_rename_and_delete() {
        let store = SqliteSessionStore::in_memory().unwrap();
        store.upsert_session(&WorkflowSession::new("s1", "wf1")).await.unwrap();

        assert!(store.rename_session("s1", "Morning research").await.unwrap());
        assert!(!store.rename_session("missing", "x").await.unwrap());
        let loaded = store.read_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.session_name(), Some("Morning research"));

        assert!(store.delete_session("s1").await.unwrap());
        assert!(!store.delete_session("s1").await.unwrap());
        assert!(store.read_session("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sessions.db");
        {
            let store = SqliteSessionStore::open(&path).unwrap();
            store
                .append_run(&WorkflowSession::new("s1", "wf1"), json!({"run_id": "r1"}))
                .await
                .unwrap();
        }
        let reopened = SqliteSessionStore::open(&path).unwrap();
        let loaded = reopened.read_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.runs.len(), 1);
    }
}
