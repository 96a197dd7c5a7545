use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::db::{from_millis, Database};
use crate::error::FlowError;
use crate::models::workflow::{Workflow, WorkflowStatus};

const SELECT_COLUMNS: &str =
    "SELECT id, name, description, status, assignee, integrations, steps, created_at, updated_at \
     FROM workflows";

#[derive(Clone)]
pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace a workflow definition.
    pub async fn save(&self, workflow: &Workflow) -> Result<(), FlowError> {
        workflow.validate()?;
        let w = workflow.clone();
        let integrations = serde_json::to_string(&w.integrations)?;
        let steps = serde_json::to_string(&w.steps)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO workflows \
                     (id, name, description, status, assignee, integrations, steps, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        w.id,
                        w.name,
                        w.description,
                        w.status.as_str(),
                        w.assignee,
                        integrations,
                        steps,
                        w.created_at.timestamp_millis(),
                        w.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Workflow>, FlowError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_workflow(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<Workflow>, FlowError> {
        self.db
            .with_conn_async(|conn| {
                let mut stmt =
                    conn.prepare(&format!("{} ORDER BY created_at DESC", SELECT_COLUMNS))?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_workflow(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Activation and pausing are the only mutations the engine performs on
    /// a workflow.
    pub async fn set_status(&self, id: &str, status: WorkflowStatus) -> Result<bool, FlowError> {
        let id = id.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE workflows SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, status.as_str(), now],
                )?;
                Ok(n > 0)
            })
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, FlowError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute("DELETE FROM workflows WHERE id = ?1", rusqlite::params![id])?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_workflow(row: &rusqlite::Row<'_>) -> Workflow {
    let status: String = row.get(3).unwrap_or_default();
    let integrations: String = row.get(5).unwrap_or_else(|_| "[]".to_string());
    let steps: String = row.get(6).unwrap_or_else(|_| "[]".to_string());

    Workflow {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        description: row.get(2).unwrap_or(None),
        status: WorkflowStatus::from_str(&status).unwrap_or_default(),
        assignee: row.get(4).unwrap_or(None),
        integrations: serde_json::from_str(&integrations).unwrap_or_default(),
        steps: serde_json::from_str(&steps).unwrap_or_default(),
        created_at: from_millis(row.get(7).ok()).unwrap_or_else(Utc::now),
        updated_at: from_millis(row.get(8).ok()).unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Workflow {
        Workflow::from_yaml(
            r#"
name: "Sample"
integrations: [gmail]
steps:
  - { id: t, label: "Start", type: trigger }
  - { id: e, label: "End", type: end }
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_get_and_status() {
        let store = WorkflowStore::new(Database::open_in_memory().unwrap());
        let wf = sample();
        store.save(&wf).await.unwrap();

        let loaded = store.get(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Sample");
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.integrations, vec!["gmail".to_string()]);
        assert_eq!(loaded.status, WorkflowStatus::Draft);

        assert!(store.set_status(&wf.id, WorkflowStatus::Active).await.unwrap());
        let loaded = store.get(&wf.id).await.unwrap().unwrap();
        assert!(loaded.is_active());

        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.delete(&wf.id).await.unwrap());
        assert!(store.get(&wf.id).await.unwrap().is_none());
    }
}
