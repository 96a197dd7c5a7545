use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use crate::db::{from_millis, Database};
use crate::error::FlowError;
use crate::models::test_run::{StepResultStatus, TestRun, TestRunStatus, TestStepResult};

const RUN_COLUMNS: &str = "SELECT id, workflow_id, test_case_id, execution_id, status, \
     failed_step_id, error, total_assertions, passed_assertions, failed_assertions, results, \
     started_at, completed_at, duration_ms, created_at FROM test_runs";

const STEP_COLUMNS: &str = "SELECT id, test_run_id, step_id, step_label, step_order, status, \
     input, output, error, started_at, duration_ms FROM test_step_results";

#[derive(Clone)]
pub struct TestRunStore {
    db: Database,
}

impl TestRunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert; a REPLACE would cascade-delete the run's step results.
    pub async fn save(&self, run: &TestRun) -> Result<(), FlowError> {
        let r = run.clone();
        let results = serde_json::to_string(&r.results)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO test_runs (id, workflow_id, test_case_id, execution_id, \
                     status, failed_step_id, error, total_assertions, passed_assertions, \
                     failed_assertions, results, started_at, completed_at, duration_ms, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15) \
                     ON CONFLICT(id) DO UPDATE SET execution_id = excluded.execution_id, \
                     status = excluded.status, failed_step_id = excluded.failed_step_id, \
                     error = excluded.error, total_assertions = excluded.total_assertions, \
                     passed_assertions = excluded.passed_assertions, \
                     failed_assertions = excluded.failed_assertions, results = excluded.results, \
                     started_at = excluded.started_at, completed_at = excluded.completed_at, \
                     duration_ms = excluded.duration_ms",
                    rusqlite::params![
                        r.id,
                        r.workflow_id,
                        r.test_case_id,
                        r.execution_id,
                        r.status.as_str(),
                        r.failed_step_id,
                        r.error,
                        r.total_assertions,
                        r.passed_assertions,
                        r.failed_assertions,
                        results,
                        r.started_at.map(|t| t.timestamp_millis()),
                        r.completed_at.map(|t| t.timestamp_millis()),
                        r.duration_ms,
                        r.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<TestRun>, FlowError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("{} WHERE id = ?1", RUN_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_run(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list_by_workflow(&self, workflow_id: &str) -> Result<Vec<TestRun>, FlowError> {
        let wf = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE workflow_id = ?1 ORDER BY created_at DESC",
                    RUN_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![wf], |row| Ok(row_to_run(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Compare-and-set on the run status. Returns false when the stored
    /// status is not `expected`.
    pub async fn transition(
        &self,
        id: &str,
        expected: TestRunStatus,
        next: TestRunStatus,
    ) -> Result<bool, FlowError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE test_runs SET status = ?3 WHERE id = ?1 AND status = ?2",
                    rusqlite::params![id, expected.as_str(), next.as_str()],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Link the run to its execution without touching its status.
    pub async fn set_execution(
        &self,
        id: &str,
        execution_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, FlowError> {
        let id = id.to_string();
        let execution_id = execution_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE test_runs SET execution_id = ?2, started_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, execution_id, started_at.timestamp_millis()],
                )?;
                Ok(n > 0)
            })
            .await
    }

    pub async fn save_step(&self, step: &TestStepResult) -> Result<(), FlowError> {
        let s = step.clone();
        let input = serde_json::to_string(&s.input)?;
        let output = s.output.as_ref().map(serde_json::to_string).transpose()?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO test_step_results (id, test_run_id, step_id, step_label, \
                     step_order, status, input, output, error, started_at, duration_ms) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        s.id,
                        s.test_run_id,
                        s.step_id,
                        s.step_label,
                        s.step_order,
                        s.status.as_str(),
                        input,
                        output,
                        s.error,
                        s.started_at.timestamp_millis(),
                        s.duration_ms,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_steps(&self, test_run_id: &str) -> Result<Vec<TestStepResult>, FlowError> {
        let run = test_run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE test_run_id = ?1 ORDER BY step_order ASC",
                    STEP_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![run], |row| Ok(row_to_step(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> TestRun {
    let status: String = row.get(4).unwrap_or_default();
    let results: String = row.get(10).unwrap_or_else(|_| "[]".to_string());
    TestRun {
        id: row.get(0).unwrap_or_default(),
        workflow_id: row.get(1).unwrap_or_default(),
        test_case_id: row.get(2).unwrap_or(None),
        execution_id: row.get(3).unwrap_or(None),
        status: TestRunStatus::from_str(&status).unwrap_or(TestRunStatus::Pending),
        failed_step_id: row.get(5).unwrap_or(None),
        error: row.get(6).unwrap_or(None),
        total_assertions: row.get(7).unwrap_or(0),
        passed_assertions: row.get(8).unwrap_or(0),
        failed_assertions: row.get(9).unwrap_or(0),
        results: serde_json::from_str(&results).unwrap_or_default(),
        started_at: from_millis(row.get(11).unwrap_or(None)),
        completed_at: from_millis(row.get(12).unwrap_or(None)),
        duration_ms: row.get(13).unwrap_or(None),
        created_at: from_millis(row.get(14).ok()).unwrap_or_else(Utc::now),
    }
}

fn row_to_step(row: &rusqlite::Row<'_>) -> TestStepResult {
    let status: String = row.get(5).unwrap_or_default();
    let input: String = row.get(6).unwrap_or_else(|_| "null".to_string());
    let output: Option<String> = row.get(7).unwrap_or(None);
    TestStepResult {
        id: row.get(0).unwrap_or_default(),
        test_run_id: row.get(1).unwrap_or_default(),
        step_id: row.get(2).unwrap_or_default(),
        step_label: row.get(3).unwrap_or_default(),
        step_order: row.get(4).unwrap_or(0),
        status: StepResultStatus::from_str(&status).unwrap_or(StepResultStatus::Running),
        input: serde_json::from_str(&input).unwrap_or(serde_json::Value::Null),
        output: output.and_then(|o| serde_json::from_str(&o).ok()),
        error: row.get(8).unwrap_or(None),
        started_at: from_millis(row.get(9).ok()).unwrap_or_else(Utc::now),
        duration_ms: row.get(10).unwrap_or(None),
    }
}
