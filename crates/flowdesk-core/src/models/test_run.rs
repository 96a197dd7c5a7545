use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::assertion::{AssertionResult, TestAssertion};
use crate::error::FlowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestRunStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Error,
    Cancelled,
}

impl TestRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    pub id: String,
    pub workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_case_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub status: TestRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total_assertions: u32,
    pub passed_assertions: u32,
    pub failed_assertions: u32,
    #[serde(default)]
    pub results: Vec<AssertionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResultStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStepResult {
    pub id: String,
    pub test_run_id: String,
    pub step_id: String,
    pub step_label: String,
    pub step_order: u32,
    pub status: StepResultStatus,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// What a step returns during a test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MockResponse {
    Output(serde_json::Value),
    Error(String),
}

/// Mock data a test run executes against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockInput {
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub responses: HashMap<String, MockResponse>,
}

/// A saved test case: mock input plus the assertions to check.
///
/// ```yaml
/// name: "reminder is sent"
/// input: { invoiceId: "INV-7" }
/// mockResponses:
///   draft-email:
///     output: { status: "sent", recipients: ["a@b.c"] }
/// assertions:
///   - { name: "sent", stepId: draft-email, path: status, type: equals, expectedValue: sent }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub mock_responses: HashMap<String, MockResponse>,
    #[serde(default)]
    pub assertions: Vec<TestAssertion>,
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl TestCase {
    pub fn from_yaml(yaml: &str) -> Result<Self, FlowError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FlowError::BadRequest(format!("Failed to parse test case: {}", e)))
    }

    pub fn from_file(path: &str) -> Result<Self, FlowError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FlowError::BadRequest(format!("Failed to read test case '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn mock_input(&self) -> MockInput {
        MockInput {
            input: self.input.clone(),
            responses: self.mock_responses.clone(),
        }
    }
}
