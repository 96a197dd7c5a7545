//! Core error type for Flowdesk.
//!
//! `FlowError` is used throughout the core domain (stores, orchestrator,
//! review gate, test runs). Blockers (`NotActive`) are raised before any
//! execution state exists; `Execution` wraps a failure raised by a step.

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Workflow is not active: {0}")]
    NotActive(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlowError {
    /// Blockers stop a workflow before it can run at all.
    pub fn is_blocker(&self) -> bool {
        matches!(self, FlowError::NotActive(_))
    }
}

impl From<rusqlite::Error> for FlowError {
    fn from(e: rusqlite::Error) -> Self {
        FlowError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        FlowError::Internal(format!("JSON error: {}", e))
    }
}
