use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::db::{from_millis, Database};
use crate::error::FlowError;
use crate::models::execution::{Execution, ExecutionStatus};

const SELECT_COLUMNS: &str = "SELECT id, workflow_id, status, current_step_id, error, test_run_id, \
     started_at, completed_at, duration_ms FROM executions";

/// Persisted execution records. Status transitions are written as they
/// happen so observers polling the store see partial progress.
#[derive(Clone)]
pub struct ExecutionStore {
    db: Database,
}

impl ExecutionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, execution: &Execution) -> Result<(), FlowError> {
        let e = execution.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO executions (id, workflow_id, status, current_step_id, \
                     error, test_run_id, started_at, completed_at, duration_ms) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        e.id,
                        e.workflow_id,
                        e.status.as_str(),
                        e.current_step_id,
                        e.error,
                        e.test_run_id,
                        e.started_at.timestamp_millis(),
                        e.completed_at.map(|t| t.timestamp_millis()),
                        e.duration_ms,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Execution>, FlowError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_execution(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list_by_workflow(&self, workflow_id: &str) -> Result<Vec<Execution>, FlowError> {
        let wf = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE workflow_id = ?1 ORDER BY started_at DESC",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![wf], |row| Ok(row_to_execution(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Record a status transition. Terminal statuses also stamp
    /// `completed_at` and the duration since `started_at`. Records already in
    /// a terminal status are left untouched; the check and the write are one
    /// statement, so a concurrent terminal write is never overwritten.
    pub async fn update_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        current_step_id: Option<String>,
        error: Option<String>,
    ) -> Result<Option<Execution>, FlowError> {
        let id = id.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE executions SET status = ?2, \
                     current_step_id = COALESCE(?3, current_step_id), \
                     error = COALESCE(?4, error), \
                     completed_at = CASE WHEN ?5 THEN ?6 ELSE completed_at END, \
                     duration_ms = CASE WHEN ?5 THEN ?6 - started_at ELSE duration_ms END \
                     WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')",
                    rusqlite::params![
                        id,
                        status.as_str(),
                        current_step_id,
                        error,
                        status.is_terminal(),
                        now,
                    ],
                )?;
                conn.query_row(
                    &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_execution(row)),
                )
                .optional()
            })
            .await
    }
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> Execution {
    let status: String = row.get(2).unwrap_or_default();
    Execution {
        id: row.get(0).unwrap_or_default(),
        workflow_id: row.get(1).unwrap_or_default(),
        status: ExecutionStatus::from_str(&status).unwrap_or(ExecutionStatus::Pending),
        current_step_id: row.get(3).unwrap_or(None),
        error: row.get(4).unwrap_or(None),
        test_run_id: row.get(5).unwrap_or(None),
        started_at: from_millis(row.get(6).ok()).unwrap_or_else(Utc::now),
        completed_at: from_millis(row.get(7).unwrap_or(None)),
        duration_ms: row.get(8).unwrap_or(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_transitions_are_persisted() {
        let store = ExecutionStore::new(Database::open_in_memory().unwrap());
        let exec = Execution::new("wf-1", ExecutionStatus::Running);
        store.save(&exec).await.unwrap();

        let updated = store
            .update_status(&exec.id, ExecutionStatus::WaitingReview, Some("s1".into()), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, ExecutionStatus::WaitingReview);
        assert_eq!(updated.current_step_id.as_deref(), Some("s1"));
        assert!(updated.completed_at.is_none());

        let done = store
            .update_status(&exec.id, ExecutionStatus::Completed, None, None)
            .await
            .unwrap()
            .unwrap();
        assert!(done.completed_at.is_some());
        assert!(done.duration_ms.is_some());

        // Terminal records are final.
        let after = store
            .update_status(&exec.id, ExecutionStatus::Running, None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, ExecutionStatus::Completed);

        assert_eq!(store.list_by_workflow("wf-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_late_write_does_not_reopen_cancelled_record() {
        let store = ExecutionStore::new(Database::open_in_memory().unwrap());
        let exec = Execution::new("wf-1", ExecutionStatus::Running);
        store.save(&exec).await.unwrap();

        let cancel = {
            let store = store.clone();
            let id = exec.id.clone();
            tokio::spawn(async move {
                store
                    .update_status(&id, ExecutionStatus::Cancelled, Some("s1".into()), None)
                    .await
            })
        };
        let mut late = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = exec.id.clone();
            late.push(tokio::spawn(async move {
                store
                    .update_status(
                        &id,
                        ExecutionStatus::WaitingReview,
                        Some(format!("s{}", i + 2)),
                        Some("agent timed out".into()),
                    )
                    .await
            }));
        }
        cancel.await.unwrap().unwrap();
        for handle in late {
            handle.await.unwrap().unwrap();
        }

        let record = store.get(&exec.id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert!(record.completed_at.is_some());

        let after = store
            .update_status(&exec.id, ExecutionStatus::Running, Some("s9".into()), Some("late".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, ExecutionStatus::Cancelled);
        assert_eq!(after.current_step_id, record.current_step_id);
        assert_eq!(after.error, record.error);
        assert_eq!(after.completed_at, record.completed_at);
    }
}
