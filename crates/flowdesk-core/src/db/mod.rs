//! SQLite database layer for Flowdesk.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::FlowError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, FlowError> {
        if db_path == ":memory:" {
            return Self::open_in_memory();
        }

        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| FlowError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| FlowError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, FlowError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| FlowError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| FlowError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, FlowError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FlowError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| FlowError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, FlowError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| FlowError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), FlowError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflows (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    description     TEXT,
                    status          TEXT NOT NULL DEFAULT 'draft',
                    assignee        TEXT,
                    integrations    TEXT NOT NULL DEFAULT '[]',
                    steps           TEXT NOT NULL DEFAULT '[]',
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS executions (
                    id              TEXT PRIMARY KEY,
                    workflow_id     TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'pending',
                    current_step_id TEXT,
                    error           TEXT,
                    test_run_id     TEXT,
                    started_at      INTEGER NOT NULL,
                    completed_at    INTEGER,
                    duration_ms     INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id);

                CREATE TABLE IF NOT EXISTS review_items (
                    id              TEXT PRIMARY KEY,
                    workflow_id     TEXT NOT NULL,
                    execution_id    TEXT NOT NULL,
                    step_id         TEXT NOT NULL,
                    step_label      TEXT NOT NULL,
                    assignee        TEXT NOT NULL,
                    action_type     TEXT NOT NULL,
                    payload         TEXT NOT NULL DEFAULT 'null',
                    chat_history    TEXT NOT NULL DEFAULT '[]',
                    needs_guidance  INTEGER NOT NULL DEFAULT 0,
                    status          TEXT NOT NULL DEFAULT 'pending',
                    reviewer_notes  TEXT,
                    created_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_review_items_workflow ON review_items(workflow_id);

                CREATE TABLE IF NOT EXISTS test_runs (
                    id                  TEXT PRIMARY KEY,
                    workflow_id         TEXT NOT NULL,
                    test_case_id        TEXT,
                    execution_id        TEXT,
                    status              TEXT NOT NULL DEFAULT 'pending',
                    failed_step_id      TEXT,
                    error               TEXT,
                    total_assertions    INTEGER NOT NULL DEFAULT 0,
                    passed_assertions   INTEGER NOT NULL DEFAULT 0,
                    failed_assertions   INTEGER NOT NULL DEFAULT 0,
                    results             TEXT NOT NULL DEFAULT '[]',
                    started_at          INTEGER,
                    completed_at        INTEGER,
                    duration_ms         INTEGER,
                    created_at          INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_test_runs_workflow ON test_runs(workflow_id);

                CREATE TABLE IF NOT EXISTS test_step_results (
                    id              TEXT PRIMARY KEY,
                    test_run_id     TEXT NOT NULL REFERENCES test_runs(id) ON DELETE CASCADE,
                    step_id         TEXT NOT NULL,
                    step_label      TEXT NOT NULL,
                    step_order      INTEGER NOT NULL,
                    status          TEXT NOT NULL,
                    input           TEXT NOT NULL DEFAULT 'null',
                    output          TEXT,
                    error           TEXT,
                    started_at      INTEGER NOT NULL,
                    duration_ms     INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_test_step_results_run ON test_step_results(test_run_id);
                ",
            )
        })
    }
}

/// Millisecond timestamps are the storage format for every time column.
pub(crate) fn from_millis(ms: Option<i64>) -> Option<chrono::DateTime<chrono::Utc>> {
    use chrono::TimeZone;
    ms.and_then(|v| chrono::Utc.timestamp_millis_opt(v).single())
}
