use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::workflow::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewActionType {
    /// The agent proposed actions that need sign-off.
    ApprovalRequired,
    /// The step failed; approving retries it.
    Error,
    /// The agent asked a clarification question.
    GuidanceRequired,
}

impl ReviewActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApprovalRequired => "approval_required",
            Self::Error => "error",
            Self::GuidanceRequired => "guidance_required",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "approval_required" => Some(Self::ApprovalRequired),
            "error" => Some(Self::Error),
            "guidance_required" => Some(Self::GuidanceRequired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewAction {
    #[serde(rename = "type")]
    pub action_type: ReviewActionType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A suspended step waiting for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    pub id: String,
    pub workflow_id: String,
    pub execution_id: String,
    pub step_id: String,
    pub step_label: String,
    pub assignee: String,
    pub action: ReviewAction,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    pub needs_guidance: bool,
    pub status: ReviewStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_notes: Option<String>,
}

impl ReviewItem {
    pub fn is_pending(&self) -> bool {
        self.status == ReviewStatus::Pending
    }
}

/// Delivered to an external system waiting on a review decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePayload {
    pub approved: bool,
    pub review_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_data: Option<serde_json::Value>,
    pub reviewed_at: DateTime<Utc>,
}
