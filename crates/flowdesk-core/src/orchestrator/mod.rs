//! Execution Orchestrator - drives a workflow instance through its steps.
//!
//! States: `Idle → Running → {WaitingReview, WaitingGuidance} → Running →
//! Completed | Failed | Cancelled`.
//!
//! The orchestrator:
//!   1. Refuses to start a workflow that is not active (blocker, no state)
//!   2. Claims the current step from the [`ExecutionStateStore`]
//!   3. Runs it through the [`StepExecutor`]
//!   4. On completion advances the index and schedules the next `advance`
//!   5. On review, guidance or error parks the instance and emits
//!      `review_needed`; only the review gate wakes it again
//!
//! Every transition is written to the execution record as it happens.

pub mod state_store;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::OrchestratorConfig;
use crate::db::Database;
use crate::error::FlowError;
use crate::events::{EventBus, ReviewNeeded, UpdateKind, WorkflowCompleted, WorkflowEvent};
use crate::executor::{StepContext, StepExecutor, StepVerdict};
use crate::models::execution::{Execution, ExecutionStatus, GuidanceEntry};
use crate::models::review::{ReviewAction, ReviewActionType, ReviewItem, ReviewStatus};
use crate::models::workflow::ChatMessage;
use crate::scheduler::{Continuation, Scheduler};
use crate::store::{ExecutionStore, ReviewStore, WorkflowStore};

pub use state_store::{
    ClaimResult, ExecutionPhase, ExecutionState, ExecutionStateSnapshot, ExecutionStateStore,
    FinishedRun, StepClaim, StoppedRun,
};

/// What a single `advance` call did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// Nothing to do: no instance, suspended, terminal or already in flight.
    Idle,
    /// The step at `index` completed; the next one is scheduled.
    StepCompleted { index: usize },
    /// The instance is parked on a review item.
    Suspended { review: ReviewItem },
    /// Every step ran.
    Completed,
}

/// Decision a reviewer made that lets a suspended instance continue.
#[derive(Debug, Clone, Default)]
pub struct ResumeRequest {
    pub guidance: Option<GuidanceEntry>,
    pub approved_step_id: Option<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    states: ExecutionStateStore,
    executor: StepExecutor,
    workflow_store: WorkflowStore,
    execution_store: ExecutionStore,
    review_store: ReviewStore,
    event_bus: EventBus,
    scheduler: Arc<dyn Scheduler>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        states: ExecutionStateStore,
        executor: StepExecutor,
        event_bus: EventBus,
        scheduler: Arc<dyn Scheduler>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            states,
            executor,
            workflow_store: WorkflowStore::new(db.clone()),
            execution_store: ExecutionStore::new(db.clone()),
            review_store: ReviewStore::new(db),
            event_bus,
            scheduler,
            config,
        }
    }

    pub fn states(&self) -> &ExecutionStateStore {
        &self.states
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn state(&self, workflow_id: &str) -> Option<ExecutionStateSnapshot> {
        self.states.snapshot(workflow_id)
    }

    // ─── Start ──────────────────────────────────────────────────────────

    /// Start a new execution and run its first step. Returns the execution
    /// id.
    pub async fn start(
        &self,
        workflow_id: &str,
        assignee_override: Option<String>,
    ) -> Result<String, FlowError> {
        let workflow = self
            .workflow_store
            .get(workflow_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("Workflow {} not found", workflow_id)))?;

        if !workflow.is_active() {
            let message = format!(
                "'{}' is {} and cannot run until it is activated",
                workflow.name,
                workflow.status.as_str()
            );
            tracing::warn!("[Orchestrator] Blocked {}: {}", workflow_id, message);
            let worker = assignee_override.as_deref().or(workflow.assignee.as_deref());
            self.event_bus
                .emit(WorkflowEvent::update(
                    workflow_id,
                    UpdateKind::Blocker,
                    None,
                    worker,
                    message.clone(),
                ))
                .await;
            return Err(FlowError::NotActive(message));
        }

        let execution = Execution::new(&workflow.id, ExecutionStatus::Running);
        let worker = assignee_override.clone().or_else(|| workflow.assignee.clone());
        let name = workflow.name.clone();
        let step_count = workflow.steps.len();
        self.states
            .insert_new(workflow, &execution.id, assignee_override)?;
        if let Err(e) = self.execution_store.save(&execution).await {
            self.states
                .finish(workflow_id, &execution.id, ExecutionPhase::Failed);
            return Err(e);
        }

        tracing::info!(
            "[Orchestrator] Started '{}' ({} steps) as execution {}",
            name,
            step_count,
            execution.id
        );
        self.event_bus
            .emit(WorkflowEvent::update(
                workflow_id,
                UpdateKind::Started,
                None,
                worker.as_deref(),
                format!("Started '{}'", name),
            ))
            .await;

        self.advance(workflow_id).await?;
        Ok(execution.id)
    }

    // ─── Step loop ──────────────────────────────────────────────────────

    /// Run the current step. A no-op unless the instance is running and no
    /// other step is in flight.
    pub async fn advance(&self, workflow_id: &str) -> Result<AdvanceOutcome, FlowError> {
        let claim = match self.states.claim_step(workflow_id) {
            ClaimResult::Idle => {
                tracing::debug!("[Orchestrator] advance({}) is idle", workflow_id);
                return Ok(AdvanceOutcome::Idle);
            }
            ClaimResult::Finished(done) => {
                self.complete_execution(workflow_id, done).await?;
                return Ok(AdvanceOutcome::Completed);
            }
            ClaimResult::Step(claim) => claim,
        };

        match self.run_claimed(workflow_id, &claim).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.abandon_claim(workflow_id, &claim, &e).await;
                Err(e)
            }
        }
    }

    /// Execute a claimed step and record its verdict. Any error leaves the
    /// claim unresolved; `advance` ends the instance when that happens.
    async fn run_claimed(
        &self,
        workflow_id: &str,
        claim: &StepClaim,
    ) -> Result<AdvanceOutcome, FlowError> {
        let worker = claim.digital_worker.as_deref();
        self.execution_store
            .update_status(
                &claim.execution_id,
                ExecutionStatus::Running,
                Some(claim.step.id.clone()),
                None,
            )
            .await?;
        self.event_bus
            .emit(WorkflowEvent::update(
                workflow_id,
                UpdateKind::StepStarted,
                Some(&claim.step.id),
                worker,
                format!("Running '{}'", claim.step.label),
            ))
            .await;

        let ctx = StepContext {
            guidance_context: claim.guidance_context.clone(),
            approved: claim.approved,
            integrations: claim.integrations.clone(),
        };

        match self.executor.execute(&claim.step, &ctx).await {
            Ok(StepVerdict::Completed { message }) => {
                if !self
                    .states
                    .complete_step(workflow_id, &claim.execution_id, claim.index)
                {
                    tracing::info!(
                        "[Orchestrator] '{}' finished after execution {} stopped",
                        claim.step.label,
                        claim.execution_id
                    );
                    return Ok(AdvanceOutcome::Idle);
                }
                let elapsed = (Utc::now() - claim.started_at).num_milliseconds();
                tracing::info!(
                    "[Orchestrator] Step {} '{}' completed in {}ms",
                    claim.index,
                    claim.step.label,
                    elapsed
                );
                self.event_bus
                    .emit(WorkflowEvent::update(
                        workflow_id,
                        UpdateKind::StepCompleted,
                        Some(&claim.step.id),
                        worker,
                        message,
                    ))
                    .await;
                self.schedule_advance(workflow_id);
                Ok(AdvanceOutcome::StepCompleted { index: claim.index })
            }
            Ok(StepVerdict::NeedsReview { actions, message }) => {
                let action = ReviewAction {
                    action_type: ReviewActionType::ApprovalRequired,
                    payload: serde_json::json!({
                        "message": message,
                        "actions": actions,
                    }),
                };
                self.suspend(workflow_id, claim, action, Vec::new(), message, None)
                    .await
            }
            Ok(StepVerdict::NeedsGuidance { question, message }) => {
                let action = ReviewAction {
                    action_type: ReviewActionType::GuidanceRequired,
                    payload: serde_json::json!({
                        "message": message,
                        "question": question,
                    }),
                };
                let chat = vec![ChatMessage::assistant(question)];
                self.suspend(workflow_id, claim, action, chat, message, None)
                    .await
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::error!("[Orchestrator] {}", reason);
                self.event_bus
                    .emit(WorkflowEvent::update(
                        workflow_id,
                        UpdateKind::StepFailed,
                        Some(&claim.step.id),
                        worker,
                        reason.clone(),
                    ))
                    .await;
                let action = ReviewAction {
                    action_type: ReviewActionType::Error,
                    payload: serde_json::json!({
                        "stepLabel": claim.step.label,
                        "error": reason,
                    }),
                };
                self.suspend(workflow_id, claim, action, Vec::new(), reason.clone(), Some(reason))
                    .await
            }
        }
    }

    /// Park the instance on a new review item.
    async fn suspend(
        &self,
        workflow_id: &str,
        claim: &StepClaim,
        action: ReviewAction,
        chat_history: Vec<ChatMessage>,
        message: String,
        error: Option<String>,
    ) -> Result<AdvanceOutcome, FlowError> {
        let needs_guidance = action.action_type == ReviewActionType::GuidanceRequired;
        let phase = if needs_guidance {
            ExecutionPhase::WaitingGuidance
        } else {
            ExecutionPhase::WaitingReview
        };
        let item = ReviewItem {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            execution_id: claim.execution_id.clone(),
            step_id: claim.step.id.clone(),
            step_label: claim.step.label.clone(),
            assignee: claim
                .digital_worker
                .clone()
                .unwrap_or_else(|| "Unassigned".to_string()),
            action,
            timestamp: Utc::now(),
            chat_history,
            needs_guidance,
            status: ReviewStatus::Pending,
            reviewer_notes: None,
        };
        // The item exists before the instance parks on it.
        self.review_store.save(&item).await?;
        if !self.states.suspend(workflow_id, &claim.execution_id, phase) {
            tracing::info!(
                "[Orchestrator] Dropping {} for '{}': execution {} stopped",
                item.action.action_type.as_str(),
                claim.step.label,
                claim.execution_id
            );
            self.review_store
                .set_status(&item.id, ReviewStatus::Cancelled, None)
                .await?;
            return Ok(AdvanceOutcome::Idle);
        }
        self.execution_store
            .update_status(
                &claim.execution_id,
                ExecutionStatus::WaitingReview,
                Some(claim.step.id.clone()),
                error,
            )
            .await?;

        tracing::info!(
            "[Orchestrator] '{}' waiting on review {} ({})",
            claim.step.label,
            item.id,
            item.action.action_type.as_str()
        );
        self.event_bus
            .emit(WorkflowEvent::ReviewNeeded(ReviewNeeded {
                workflow_id: workflow_id.to_string(),
                step_id: claim.step.id.clone(),
                digital_worker_name: claim.digital_worker.clone(),
                message,
                review: item.clone(),
                timestamp: Utc::now(),
            }))
            .await;
        Ok(AdvanceOutcome::Suspended { review: item })
    }

    /// End the instance as failed after its claimed step could not be
    /// recorded. Persistence here is best effort: the in-memory instance is
    /// released either way so the workflow can be started again.
    async fn abandon_claim(&self, workflow_id: &str, claim: &StepClaim, cause: &FlowError) {
        let Some(stopped) =
            self.states
                .finish(workflow_id, &claim.execution_id, ExecutionPhase::Failed)
        else {
            return;
        };
        self.scheduler.cancel(workflow_id);
        let reason = format!("Step '{}' aborted: {}", claim.step.label, cause);
        tracing::error!("[Orchestrator] Execution {} failed: {}", claim.execution_id, reason);

        if let Err(e) = self
            .review_store
            .cancel_pending_for_workflow(workflow_id)
            .await
        {
            tracing::error!("[Orchestrator] Failed to close reviews for {}: {}", workflow_id, e);
        }
        if let Err(e) = self
            .execution_store
            .update_status(
                &claim.execution_id,
                ExecutionStatus::Failed,
                Some(claim.step.id.clone()),
                Some(reason.clone()),
            )
            .await
        {
            tracing::error!(
                "[Orchestrator] Failed to record failure of execution {}: {}",
                claim.execution_id,
                e
            );
        }
        self.event_bus
            .emit(WorkflowEvent::update(
                workflow_id,
                UpdateKind::Failed,
                Some(&claim.step.id),
                stopped.digital_worker.as_deref(),
                reason,
            ))
            .await;
    }

    async fn complete_execution(
        &self,
        workflow_id: &str,
        done: FinishedRun,
    ) -> Result<(), FlowError> {
        let finished = self
            .execution_store
            .update_status(&done.execution_id, ExecutionStatus::Completed, None, None)
            .await?;
        let duration_ms = finished
            .and_then(|e| e.duration_ms)
            .unwrap_or_else(|| (Utc::now() - done.started_at).num_milliseconds());

        tracing::info!(
            "[Orchestrator] Execution {} completed in {}ms",
            done.execution_id,
            duration_ms
        );
        self.event_bus
            .emit(WorkflowEvent::Completed(WorkflowCompleted {
                workflow_id: workflow_id.to_string(),
                execution_id: done.execution_id,
                digital_worker_name: done.digital_worker,
                message: "Workflow completed".to_string(),
                duration_ms,
                timestamp: Utc::now(),
            }))
            .await;
        Ok(())
    }

    /// Hand the next `advance` to the scheduler after the inter-step delay.
    fn schedule_advance(&self, workflow_id: &str) {
        let orchestrator = self.clone();
        let id = workflow_id.to_string();
        let task: Continuation = Box::pin(async move {
            if let Err(e) = orchestrator.advance(&id).await {
                tracing::error!("[Orchestrator] Scheduled advance for {} failed: {}", id, e);
            }
        });
        self.scheduler
            .schedule(workflow_id, self.config.inter_step_delay(), task);
    }

    // ─── External transitions ───────────────────────────────────────────

    /// Set a suspended instance running again at its current index. The
    /// caller runs `advance` afterwards.
    pub async fn resume(
        &self,
        workflow_id: &str,
        execution_id: &str,
        request: ResumeRequest,
    ) -> Result<(), FlowError> {
        self.states
            .resume(workflow_id, execution_id, request.guidance, request.approved_step_id)?;
        let snapshot = self.states.snapshot(workflow_id);
        let step_id = snapshot.as_ref().and_then(|s| s.current_step_id.clone());
        self.execution_store
            .update_status(execution_id, ExecutionStatus::Running, step_id.clone(), None)
            .await?;
        self.event_bus
            .emit(WorkflowEvent::update(
                workflow_id,
                UpdateKind::Resumed,
                step_id.as_deref(),
                None,
                "Resumed after review",
            ))
            .await;
        Ok(())
    }

    /// End a live execution as failed, e.g. after a rejected review.
    pub async fn fail(
        &self,
        workflow_id: &str,
        execution_id: &str,
        kind: UpdateKind,
        reason: String,
    ) -> Result<bool, FlowError> {
        let Some(stopped) = self
            .states
            .finish(workflow_id, execution_id, ExecutionPhase::Failed)
        else {
            return Ok(false);
        };
        self.scheduler.cancel(workflow_id);
        self.review_store
            .cancel_pending_for_workflow(workflow_id)
            .await?;
        self.execution_store
            .update_status(
                execution_id,
                ExecutionStatus::Failed,
                stopped.current_step_id.clone(),
                Some(reason.clone()),
            )
            .await?;

        tracing::warn!("[Orchestrator] Execution {} failed: {}", execution_id, reason);
        self.event_bus
            .emit(WorkflowEvent::update(
                workflow_id,
                kind,
                stopped.current_step_id.as_deref(),
                stopped.digital_worker.as_deref(),
                reason,
            ))
            .await;
        Ok(true)
    }

    /// Cancel the workflow's live execution. Final: no later `advance` or
    /// resume affects it.
    pub async fn cancel(&self, workflow_id: &str) -> Result<bool, FlowError> {
        let Some(stopped) = self.states.cancel(workflow_id) else {
            return Ok(false);
        };
        self.scheduler.cancel(workflow_id);
        let closed = self
            .review_store
            .cancel_pending_for_workflow(workflow_id)
            .await?;
        self.execution_store
            .update_status(
                &stopped.execution_id,
                ExecutionStatus::Cancelled,
                stopped.current_step_id.clone(),
                None,
            )
            .await?;

        tracing::info!(
            "[Orchestrator] Cancelled execution {} ({} open reviews closed)",
            stopped.execution_id,
            closed
        );
        self.event_bus
            .emit(WorkflowEvent::update(
                workflow_id,
                UpdateKind::Cancelled,
                stopped.current_step_id.as_deref(),
                stopped.digital_worker.as_deref(),
                "Execution cancelled",
            ))
            .await;
        Ok(true)
    }
}
