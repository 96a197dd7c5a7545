//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and reuses
//! the flowdesk-core domain logic through `AppState`.

pub mod run;
pub mod test;
pub mod workflow;

use std::sync::Arc;

use flowdesk_core::state::{AppState, AppStateInner};
use flowdesk_core::{Database, FlowdeskConfig};

use crate::agent::LocalAgent;

/// Load the configuration and open the database. `--db` wins over the
/// configured database path.
pub fn init_state(db_path: Option<&str>, config_path: Option<&str>) -> Result<AppState, String> {
    let config = FlowdeskConfig::load(config_path).map_err(|e| e.to_string())?;
    let db_path = db_path.unwrap_or(&config.database.path).to_string();
    let db = Database::open(&db_path)
        .map_err(|e| format!("Failed to open database '{}': {}", db_path, e))?;
    tracing::debug!("[CLI] Using database {}", db_path);
    Ok(Arc::new(AppStateInner::new(
        db,
        config,
        Arc::new(LocalAgent::new()),
    )))
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", head)
    }
}
