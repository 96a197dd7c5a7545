use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::db::{from_millis, Database};
use crate::error::FlowError;
use crate::models::review::{ReviewAction, ReviewActionType, ReviewItem, ReviewStatus};
use crate::models::workflow::ChatMessage;

const SELECT_COLUMNS: &str = "SELECT id, workflow_id, execution_id, step_id, step_label, assignee, \
     action_type, payload, chat_history, needs_guidance, status, reviewer_notes, created_at \
     FROM review_items";

/// Review items. The pending set is every row with status `pending`;
/// resolving an item moves it out of that set but keeps it for audit.
#[derive(Clone)]
pub struct ReviewStore {
    db: Database,
}

impl ReviewStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, item: &ReviewItem) -> Result<(), FlowError> {
        let r = item.clone();
        let payload = serde_json::to_string(&r.action.payload)?;
        let chat = serde_json::to_string(&r.chat_history)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO review_items (id, workflow_id, execution_id, step_id, \
                     step_label, assignee, action_type, payload, chat_history, needs_guidance, \
                     status, reviewer_notes, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    rusqlite::params![
                        r.id,
                        r.workflow_id,
                        r.execution_id,
                        r.step_id,
                        r.step_label,
                        r.assignee,
                        r.action.action_type.as_str(),
                        payload,
                        chat,
                        r.needs_guidance as i64,
                        r.status.as_str(),
                        r.reviewer_notes,
                        r.timestamp.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ReviewItem>, FlowError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_review(row)),
                )
                .optional()
            })
            .await
    }

    /// Pending items, optionally for a single workflow, oldest first.
    pub async fn list_pending(&self, workflow_id: Option<&str>) -> Result<Vec<ReviewItem>, FlowError> {
        let wf = workflow_id.map(|s| s.to_string());
        self.db
            .with_conn_async(move |conn| {
                let rows = match wf {
                    Some(wf) => {
                        let mut stmt = conn.prepare(&format!(
                            "{} WHERE status = 'pending' AND workflow_id = ?1 ORDER BY created_at ASC",
                            SELECT_COLUMNS
                        ))?;
                        let rows = stmt
                            .query_map(rusqlite::params![wf], |row| Ok(row_to_review(row)))?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "{} WHERE status = 'pending' ORDER BY created_at ASC",
                            SELECT_COLUMNS
                        ))?;
                        let rows = stmt
                            .query_map([], |row| Ok(row_to_review(row)))?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                };
                Ok(rows)
            })
            .await
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: ReviewStatus,
        reviewer_notes: Option<String>,
    ) -> Result<bool, FlowError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE review_items SET status = ?2, \
                     reviewer_notes = COALESCE(?3, reviewer_notes) WHERE id = ?1",
                    rusqlite::params![id, status.as_str(), reviewer_notes],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Append a message to a pending item's chat history. Returns the
    /// updated item, or `None` once the item is no longer pending.
    pub async fn append_chat(
        &self,
        id: &str,
        message: &ChatMessage,
    ) -> Result<Option<ReviewItem>, FlowError> {
        let id = id.to_string();
        let message = serde_json::to_string(message)?;
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE review_items SET chat_history = json_insert(chat_history, '$[#]', json(?2)) \
                     WHERE id = ?1 AND status = 'pending'",
                    rusqlite::params![id, message],
                )?;
                if n == 0 {
                    return Ok(None);
                }
                conn.query_row(
                    &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_review(row)),
                )
                .optional()
            })
            .await
    }

    /// Cancel every pending item of a workflow; returns how many were open.
    pub async fn cancel_pending_for_workflow(&self, workflow_id: &str) -> Result<usize, FlowError> {
        let wf = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE review_items SET status = 'cancelled' \
                     WHERE workflow_id = ?1 AND status = 'pending'",
                    rusqlite::params![wf],
                )
            })
            .await
    }
}

fn row_to_review(row: &rusqlite::Row<'_>) -> ReviewItem {
    let action_type: String = row.get(6).unwrap_or_default();
    let payload: String = row.get(7).unwrap_or_else(|_| "null".to_string());
    let chat: String = row.get(8).unwrap_or_else(|_| "[]".to_string());
    let status: String = row.get(10).unwrap_or_default();

    ReviewItem {
        id: row.get(0).unwrap_or_default(),
        workflow_id: row.get(1).unwrap_or_default(),
        execution_id: row.get(2).unwrap_or_default(),
        step_id: row.get(3).unwrap_or_default(),
        step_label: row.get(4).unwrap_or_default(),
        assignee: row.get(5).unwrap_or_default(),
        action: ReviewAction {
            action_type: ReviewActionType::from_str(&action_type)
                .unwrap_or(ReviewActionType::ApprovalRequired),
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        },
        chat_history: serde_json::from_str(&chat).unwrap_or_default(),
        needs_guidance: row.get::<_, i64>(9).unwrap_or(0) != 0,
        status: ReviewStatus::from_str(&status).unwrap_or(ReviewStatus::Pending),
        reviewer_notes: row.get(11).unwrap_or(None),
        timestamp: from_millis(row.get(12).ok()).unwrap_or_else(Utc::now),
    }
}
