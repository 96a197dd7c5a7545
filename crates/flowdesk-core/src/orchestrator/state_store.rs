//! Execution State Store - one mutable record per workflow instance.
//!
//! Shared by the orchestrator and the review gate. Every transition is a
//! single check-and-set under one lock, which is what keeps two overlapping
//! `advance` calls from both executing the same step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::models::execution::GuidanceEntry;
use crate::models::workflow::{Workflow, WorkflowStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Running,
    WaitingReview,
    WaitingGuidance,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::WaitingReview => "waiting_review",
            Self::WaitingGuidance => "waiting_guidance",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub execution_id: String,
    pub workflow: Arc<Workflow>,
    /// Steps in execution order.
    pub steps: Arc<Vec<WorkflowStep>>,
    pub current_step_index: usize,
    pub running: bool,
    pub phase: ExecutionPhase,
    /// A step has been claimed and its result is not recorded yet.
    pub in_flight: bool,
    /// Step a reviewer accepted; its next execution completes without an
    /// agent call.
    pub approved_step_id: Option<String>,
    pub assignee_override: Option<String>,
    pub started_at: DateTime<Utc>,
    pub guidance_context: Vec<GuidanceEntry>,
}

impl ExecutionState {
    fn new(workflow: Workflow, execution_id: &str, assignee_override: Option<String>) -> Self {
        let steps = workflow.ordered_steps();
        Self {
            execution_id: execution_id.to_string(),
            workflow: Arc::new(workflow),
            steps: Arc::new(steps),
            current_step_index: 0,
            running: true,
            phase: ExecutionPhase::Running,
            in_flight: false,
            approved_step_id: None,
            assignee_override,
            started_at: Utc::now(),
            guidance_context: Vec::new(),
        }
    }

    fn is_live(&self) -> bool {
        !self.phase.is_terminal()
    }

    /// Name reported as the digital worker for `step`.
    fn worker_for(&self, step: Option<&WorkflowStep>) -> Option<String> {
        self.assignee_override
            .clone()
            .or_else(|| step.and_then(|s| s.agent_name().map(str::to_string)))
            .or_else(|| self.workflow.assignee.clone())
    }
}

/// Read-only view of an execution for observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStateSnapshot {
    pub workflow_id: String,
    pub execution_id: String,
    pub current_step_index: usize,
    pub total_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    pub running: bool,
    pub phase: ExecutionPhase,
    pub started_at: DateTime<Utc>,
    pub guidance_context: Vec<GuidanceEntry>,
}

/// A step handed to the caller for execution.
#[derive(Debug, Clone)]
pub struct StepClaim {
    pub execution_id: String,
    pub index: usize,
    pub step: WorkflowStep,
    pub integrations: Vec<String>,
    pub guidance_context: Vec<GuidanceEntry>,
    pub approved: bool,
    pub digital_worker: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Every step ran; the instance is now `Completed`.
#[derive(Debug, Clone)]
pub struct FinishedRun {
    pub execution_id: String,
    pub started_at: DateTime<Utc>,
    pub digital_worker: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ClaimResult {
    /// Missing, suspended, terminal or already in flight.
    Idle,
    Finished(FinishedRun),
    Step(StepClaim),
}

/// An instance that was just moved to a terminal phase from outside the
/// step loop.
#[derive(Debug, Clone)]
pub struct StoppedRun {
    pub execution_id: String,
    pub current_step_id: Option<String>,
    pub digital_worker: Option<String>,
}

#[derive(Clone, Default)]
pub struct ExecutionStateStore {
    states: Arc<Mutex<HashMap<String, ExecutionState>>>,
}

impl ExecutionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ExecutionState>> {
        // Every critical section leaves the map consistent, so a poisoned
        // lock is still usable.
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a fresh instance at step 0. A live instance for the same
    /// workflow is a conflict; a terminal one is replaced.
    pub fn insert_new(
        &self,
        workflow: Workflow,
        execution_id: &str,
        assignee_override: Option<String>,
    ) -> Result<(), FlowError> {
        let mut states = self.lock();
        if let Some(existing) = states.get(&workflow.id) {
            if existing.is_live() {
                return Err(FlowError::Conflict(format!(
                    "Workflow {} already has a live execution ({})",
                    workflow.id, existing.execution_id
                )));
            }
        }
        let id = workflow.id.clone();
        states.insert(id, ExecutionState::new(workflow, execution_id, assignee_override));
        Ok(())
    }

    /// Claim the current step for execution.
    pub fn claim_step(&self, workflow_id: &str) -> ClaimResult {
        let mut states = self.lock();
        let Some(state) = states.get_mut(workflow_id) else {
            return ClaimResult::Idle;
        };
        if !state.running || !state.is_live() || state.in_flight {
            return ClaimResult::Idle;
        }

        if state.current_step_index >= state.steps.len() {
            state.running = false;
            state.phase = ExecutionPhase::Completed;
            return ClaimResult::Finished(FinishedRun {
                execution_id: state.execution_id.clone(),
                started_at: state.started_at,
                digital_worker: state.worker_for(None),
            });
        }

        let step = state.steps[state.current_step_index].clone();
        let now = Utc::now();
        state.in_flight = true;
        ClaimResult::Step(StepClaim {
            execution_id: state.execution_id.clone(),
            index: state.current_step_index,
            approved: state.approved_step_id.as_deref() == Some(step.id.as_str()),
            digital_worker: state.worker_for(Some(&step)),
            integrations: state.workflow.integrations.clone(),
            guidance_context: state.guidance_context.clone(),
            started_at: now,
            step,
        })
    }

    /// Record a completed step and move to the next index. False when the
    /// claim is stale (cancelled or replaced while the step ran).
    pub fn complete_step(&self, workflow_id: &str, execution_id: &str, index: usize) -> bool {
        let mut states = self.lock();
        let Some(state) = states.get_mut(workflow_id) else {
            return false;
        };
        if state.execution_id != execution_id {
            return false;
        }
        let valid = state.in_flight
            && state.running
            && state.is_live()
            && state.current_step_index == index;
        state.in_flight = false;
        if valid {
            state.current_step_index += 1;
            state.approved_step_id = None;
        }
        valid
    }

    /// Park the instance at its current step until the review gate resumes
    /// it.
    pub fn suspend(&self, workflow_id: &str, execution_id: &str, phase: ExecutionPhase) -> bool {
        let mut states = self.lock();
        let Some(state) = states.get_mut(workflow_id) else {
            return false;
        };
        if state.execution_id != execution_id || !state.is_live() || !state.in_flight {
            return false;
        }
        state.in_flight = false;
        state.running = false;
        state.phase = phase;
        true
    }

    /// Set a suspended instance running again at the same index.
    pub fn resume(
        &self,
        workflow_id: &str,
        execution_id: &str,
        guidance: Option<GuidanceEntry>,
        approved_step_id: Option<String>,
    ) -> Result<(), FlowError> {
        let mut states = self.lock();
        let state = states
            .get_mut(workflow_id)
            .ok_or_else(|| FlowError::NotFound(format!("No execution for workflow {}", workflow_id)))?;
        if state.execution_id != execution_id {
            return Err(FlowError::Conflict(format!(
                "Execution {} is no longer current for workflow {}",
                execution_id, workflow_id
            )));
        }
        if !state.is_live() {
            return Err(FlowError::Conflict(format!(
                "Execution {} is already {}",
                execution_id,
                state.phase.as_str()
            )));
        }
        if state.running || state.in_flight {
            return Err(FlowError::Conflict(format!(
                "Execution {} is already running",
                execution_id
            )));
        }
        if let Some(entry) = guidance {
            state.guidance_context.push(entry);
        }
        if approved_step_id.is_some() {
            state.approved_step_id = approved_step_id;
        }
        state.running = true;
        state.phase = ExecutionPhase::Running;
        Ok(())
    }

    /// Move a live instance of `execution_id` to a terminal phase.
    pub fn finish(
        &self,
        workflow_id: &str,
        execution_id: &str,
        phase: ExecutionPhase,
    ) -> Option<StoppedRun> {
        let mut states = self.lock();
        let state = states.get_mut(workflow_id)?;
        if state.execution_id != execution_id {
            return None;
        }
        stop(state, phase)
    }

    /// Cancel whatever live instance the workflow has.
    pub fn cancel(&self, workflow_id: &str) -> Option<StoppedRun> {
        let mut states = self.lock();
        let state = states.get_mut(workflow_id)?;
        stop(state, ExecutionPhase::Cancelled)
    }

    pub fn snapshot(&self, workflow_id: &str) -> Option<ExecutionStateSnapshot> {
        let states = self.lock();
        states.get(workflow_id).map(|s| ExecutionStateSnapshot {
            workflow_id: workflow_id.to_string(),
            execution_id: s.execution_id.clone(),
            current_step_index: s.current_step_index,
            total_steps: s.steps.len(),
            current_step_id: s.steps.get(s.current_step_index).map(|st| st.id.clone()),
            running: s.running,
            phase: s.phase,
            started_at: s.started_at,
            guidance_context: s.guidance_context.clone(),
        })
    }

    /// Workflow ids with a live instance.
    pub fn live_workflows(&self) -> Vec<String> {
        let states = self.lock();
        states
            .iter()
            .filter(|(_, s)| s.is_live())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn stop(state: &mut ExecutionState, phase: ExecutionPhase) -> Option<StoppedRun> {
    if !state.is_live() {
        return None;
    }
    let current = state.steps.get(state.current_step_index);
    let stopped = StoppedRun {
        execution_id: state.execution_id.clone(),
        current_step_id: current.map(|s| s.id.clone()),
        digital_worker: state.worker_for(current),
    };
    state.running = false;
    state.in_flight = false;
    state.phase = phase;
    Some(stopped)
}
