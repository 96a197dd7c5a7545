//! Workflow definitions.
//!
//! A workflow is an ordered list of steps plus a lifecycle status. It is
//! authored elsewhere (chat flow, dashboard) and is read-only to the
//! orchestrator. Workflows can also be written as YAML:
//!
//! ```yaml
//! name: "Invoice follow-up"
//! status: active
//! assignee: "Billing Assistant"
//! integrations: [gmail]
//! steps:
//!   - id: trigger
//!     label: "New overdue invoice"
//!     type: trigger
//!   - id: draft-email
//!     label: "Draft reminder email"
//!     type: action
//!     assignee: { kind: ai, agentName: "Billing Assistant" }
//!     requirements:
//!       blueprint:
//!         greenList: ["draft email", "read invoice"]
//!         redList: ["send payment link"]
//!   - id: done
//!     label: "Done"
//!     type: end
//! ```

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FlowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Paused,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Trigger,
    Action,
    Decision,
    End,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Action => "action",
            Self::Decision => "decision",
            Self::End => "end",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssigneeKind {
    Ai,
    Human,
}

/// Who carries out a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepAssignee {
    pub kind: AssigneeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

/// A step's action policy: explicitly allowed and explicitly forbidden actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Blueprint {
    #[serde(default)]
    pub green_list: Vec<String>,
    #[serde(default)]
    pub red_list: Vec<String>,
}

impl Blueprint {
    pub fn is_empty(&self) -> bool {
        self.green_list.is_empty() && self.red_list.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Requirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint: Option<Blueprint>,
    /// Conversation that produced the requirements.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chat_history: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<StepAssignee>,
    #[serde(default)]
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Requirements>,
}

impl WorkflowStep {
    pub fn blueprint(&self) -> Option<&Blueprint> {
        self.requirements.as_ref().and_then(|r| r.blueprint.as_ref())
    }

    pub fn is_human(&self) -> bool {
        matches!(
            self.assignee,
            Some(StepAssignee {
                kind: AssigneeKind::Human,
                ..
            })
        )
    }

    pub fn agent_name(&self) -> Option<&str> {
        self.assignee.as_ref().and_then(|a| a.agent_name.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Connected integrations the agent may use (e.g. "gmail", "slack").
    #[serde(default)]
    pub integrations: Vec<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Workflow {
    /// Parse a workflow from a YAML (or JSON) string and assign step order
    /// from position when the source left it at zero.
    pub fn from_yaml(yaml: &str) -> Result<Self, FlowError> {
        let mut wf: Workflow = serde_yaml::from_str(yaml)
            .map_err(|e| FlowError::BadRequest(format!("Failed to parse workflow YAML: {}", e)))?;
        if wf.steps.iter().all(|s| s.order == 0) {
            for (i, step) in wf.steps.iter_mut().enumerate() {
                step.order = i as u32;
            }
        }
        wf.validate()?;
        Ok(wf)
    }

    pub fn from_file(path: &str) -> Result<Self, FlowError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FlowError::BadRequest(format!("Failed to read workflow file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        if self.name.trim().is_empty() {
            return Err(FlowError::BadRequest("Workflow name is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(FlowError::BadRequest(format!(
                    "Step '{}' has an empty id",
                    step.label
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(FlowError::BadRequest(format!(
                    "Duplicate step id '{}'",
                    step.id
                )));
            }
        }
        Ok(())
    }

    /// Steps sorted by their order index.
    pub fn ordered_steps(&self) -> Vec<WorkflowStep> {
        let mut steps = self.steps.clone();
        steps.sort_by_key(|s| s.order);
        steps
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }
}
