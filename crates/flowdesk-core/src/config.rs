//! Runtime configuration.
//!
//! ```yaml
//! orchestrator:
//!   inter_step_delay_ms: 1000
//! blueprint:
//!   default_policy: deny
//! events:
//!   channel_capacity: 256
//!   history_limit: 256
//! database:
//!   path: "flowdesk.db"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::blueprint::DefaultPolicy;
use crate::error::FlowError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FlowdeskConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub blueprint: BlueprintConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Pause between a completed step and the next one.
    #[serde(default = "default_inter_step_delay_ms")]
    pub inter_step_delay_ms: u64,
}

fn default_inter_step_delay_ms() -> u64 {
    1000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            inter_step_delay_ms: default_inter_step_delay_ms(),
        }
    }
}

impl OrchestratorConfig {
    pub fn inter_step_delay(&self) -> Duration {
        Duration::from_millis(self.inter_step_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BlueprintConfig {
    #[serde(default)]
    pub default_policy: DefaultPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Events kept per workflow in the activity buffer.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_channel_capacity() -> usize {
    256
}

fn default_history_limit() -> usize {
    256
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "flowdesk.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl FlowdeskConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, FlowError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FlowError::BadRequest(format!("Failed to parse config: {}", e)))
    }

    pub fn from_file(path: &str) -> Result<Self, FlowError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FlowError::BadRequest(format!("Failed to read config '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    /// `~/.config/flowdesk/config.yaml` (platform equivalent).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("flowdesk").join("config.yaml"))
    }

    /// Load an explicit file, else the default path if it exists, else
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, FlowError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(p) if p.exists() => {
                tracing::info!("[Config] Loading {}", p.display());
                Self::from_file(&p.to_string_lossy())
            }
            _ => Ok(Self::default()),
        }
    }
}
