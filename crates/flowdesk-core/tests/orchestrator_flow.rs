//! Integration tests for the execution orchestrator and review gate.
//!
//! Every test runs against an in-memory SQLite database and a
//! `ManualScheduler`, so inter-step continuations are driven explicitly and
//! nothing waits on the wall clock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use flowdesk_core::events::{UpdateKind, WorkflowEvent};
use flowdesk_core::executor::{AgentCapability, AgentError, AgentOutcome, AgentRequest, ProposedAction};
use flowdesk_core::models::execution::ExecutionStatus;
use flowdesk_core::models::review::{ResumePayload, ReviewActionType, ReviewStatus};
use flowdesk_core::models::workflow::{Workflow, WorkflowStatus};
use flowdesk_core::orchestrator::{AdvanceOutcome, ExecutionPhase};
use flowdesk_core::review::{ApprovalInput, ResumeSignal};
use flowdesk_core::scheduler::{ManualScheduler, Scheduler};
use flowdesk_core::state::{AppState, AppStateInner};
use flowdesk_core::{Database, FlowError, FlowdeskConfig};

// ─── Fixtures ─────────────────────────────────────────────────────────────

/// Agent that replays scripted results per step id and records each call
/// as `(step id, guidance entries seen)`.
#[derive(Default)]
struct ScriptedAgent {
    scripts: Mutex<HashMap<String, VecDeque<Result<AgentOutcome, AgentError>>>>,
    calls: Mutex<Vec<(String, usize)>>,
}

impl ScriptedAgent {
    fn script(&self, step_id: &str, result: Result<AgentOutcome, AgentError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(step_id.to_string())
            .or_default()
            .push_back(result);
    }

    fn calls_for(&self, step_id: &str) -> Vec<usize> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == step_id)
            .map(|(_, guidance)| *guidance)
            .collect()
    }
}

#[async_trait]
impl AgentCapability for ScriptedAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<AgentOutcome, AgentError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.step.id.clone(), request.guidance_context.len()));
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&request.step.id)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Ok(AgentOutcome::default()))
    }
}

struct Harness {
    state: AppState,
    scheduler: ManualScheduler,
    agent: Arc<ScriptedAgent>,
}

fn harness() -> Harness {
    let db = Database::open(":memory:").expect("Failed to open in-memory database");
    let scheduler = ManualScheduler::new();
    let agent = Arc::new(ScriptedAgent::default());
    let state: AppState = Arc::new(AppStateInner::with_scheduler(
        db,
        FlowdeskConfig::default(),
        agent.clone(),
        Arc::new(scheduler.clone()),
    ));
    Harness {
        state,
        scheduler,
        agent,
    }
}

const INVOICE_FLOW: &str = r#"
id: invoice-flow
name: "Invoice follow-up"
status: active
assignee: "Billing Assistant"
integrations: [gmail]
steps:
  - id: trigger
    label: "Overdue invoice"
    type: trigger
  - id: draft
    label: "Draft reminder"
    type: action
    assignee: { kind: ai, agentName: "Billing Assistant" }
    requirements:
      blueprint:
        greenList: ["draft email"]
        redList: ["send payment link"]
  - id: done
    label: "Done"
    type: end
"#;

async fn import(h: &Harness, status: WorkflowStatus) -> Workflow {
    let mut wf = Workflow::from_yaml(INVOICE_FLOW).unwrap();
    wf.status = status;
    h.state.workflow_store.save(&wf).await.unwrap();
    wf
}

fn proposes(action: &str) -> Result<AgentOutcome, AgentError> {
    Ok(AgentOutcome {
        actions: vec![ProposedAction::new(action)],
        message: format!("Proposed: {}", action),
        ..Default::default()
    })
}

async fn events(h: &Harness, wf: &Workflow) -> Vec<WorkflowEvent> {
    h.state.event_bus.history(&wf.id).await
}

fn kinds(events: &[WorkflowEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.as_str()).collect()
}

fn has_update(events: &[WorkflowEvent], kind: UpdateKind) -> bool {
    events
        .iter()
        .any(|e| matches!(e, WorkflowEvent::WorkflowUpdate(u) if u.kind == kind))
}

// ─── Start ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_inactive_workflow_is_blocked_without_state() {
    let h = harness();
    for status in [WorkflowStatus::Draft, WorkflowStatus::Paused] {
        let wf = import(&h, status).await;
        let err = h.state.orchestrator.start(&wf.id, None).await.unwrap_err();
        assert!(err.is_blocker(), "{:?}", err);
        assert!(h.state.orchestrator.state(&wf.id).is_none());
    }

    let wf = Workflow::from_yaml(INVOICE_FLOW).unwrap();
    let history = events(&h, &wf).await;
    assert_eq!(history.len(), 2);
    assert!(history
        .iter()
        .all(|e| matches!(e, WorkflowEvent::WorkflowUpdate(u) if u.kind == UpdateKind::Blocker)));
    assert!(h.agent.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_workflow_is_not_found() {
    let h = harness();
    let err = h.state.orchestrator.start("missing", None).await.unwrap_err();
    assert!(matches!(err, FlowError::NotFound(_)));
}

#[tokio::test]
async fn test_second_start_conflicts_while_live() {
    let h = harness();
    let wf = import(&h, WorkflowStatus::Active).await;
    h.state.orchestrator.start(&wf.id, None).await.unwrap();
    let err = h.state.orchestrator.start(&wf.id, None).await.unwrap_err();
    assert!(matches!(err, FlowError::Conflict(_)));
}

// ─── Step loop ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_blueprint_step_reviewed_once_then_completes() {
    let h = harness();
    let wf = import(&h, WorkflowStatus::Active).await;
    h.agent.script("draft", proposes("draft email to client"));

    let execution_id = h.state.orchestrator.start(&wf.id, None).await.unwrap();
    assert_eq!(h.scheduler.queued_delays(), vec![Duration::from_millis(1000)]);
    h.scheduler.run_until_idle().await;

    let snapshot = h.state.orchestrator.state(&wf.id).unwrap();
    assert_eq!(snapshot.current_step_index, 1);
    assert_eq!(snapshot.phase, ExecutionPhase::WaitingReview);
    assert!(!snapshot.running);

    let pending = h.state.review_gate.pending(Some(&wf.id)).await.unwrap();
    assert_eq!(pending.len(), 1);
    let review = &pending[0];
    assert_eq!(review.step_id, "draft");
    assert_eq!(review.assignee, "Billing Assistant");
    assert_eq!(review.action.action_type, ReviewActionType::ApprovalRequired);
    assert_eq!(review.action.payload["actions"][0]["verdict"], "allowed");

    let record = h.state.execution_store.get(&execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::WaitingReview);
    assert_eq!(record.current_step_id.as_deref(), Some("draft"));

    let outcome = h
        .state
        .review_gate
        .approve(&review.id, ApprovalInput::default())
        .await
        .unwrap();
    assert_eq!(outcome, AdvanceOutcome::StepCompleted { index: 1 });
    h.scheduler.run_until_idle().await;

    let history = events(&h, &wf).await;
    let names = kinds(&history);
    assert_eq!(names.iter().filter(|k| **k == "review_needed").count(), 1);
    assert_eq!(names.iter().filter(|k| **k == "completed").count(), 1);
    let review_at = names.iter().position(|k| *k == "review_needed").unwrap();
    let completed_at = names.iter().position(|k| *k == "completed").unwrap();
    assert!(review_at < completed_at);
    let draft_completed = history
        .iter()
        .position(|e| {
            matches!(e, WorkflowEvent::WorkflowUpdate(u)
                if u.kind == UpdateKind::StepCompleted && u.step_id.as_deref() == Some("draft"))
        })
        .unwrap();
    assert!(review_at < draft_completed);

    // Approval completes the step without asking the agent again.
    assert_eq!(h.agent.calls_for("draft").len(), 1);
    assert_eq!(
        h.state.orchestrator.state(&wf.id).unwrap().phase,
        ExecutionPhase::Completed
    );
    let record = h.state.execution_store.get(&execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(record.duration_ms.is_some());
    let review = h.state.review_gate.get(&review.id).await.unwrap().unwrap();
    assert_eq!(review.status, ReviewStatus::Approved);
}

#[tokio::test]
async fn test_advance_is_idle_while_suspended() {
    let h = harness();
    let wf = import(&h, WorkflowStatus::Active).await;
    h.agent.script("draft", proposes("draft email"));
    h.state.orchestrator.start(&wf.id, None).await.unwrap();
    h.scheduler.run_until_idle().await;

    let before = h.agent.calls.lock().unwrap().len();
    for _ in 0..3 {
        let outcome = h.state.orchestrator.advance(&wf.id).await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Idle);
    }
    assert_eq!(h.agent.calls.lock().unwrap().len(), before);
    assert_eq!(h.state.orchestrator.state(&wf.id).unwrap().current_step_index, 1);
    assert_eq!(
        h.state.orchestrator.advance("never-started").await.unwrap(),
        AdvanceOutcome::Idle
    );
}

#[tokio::test]
async fn test_approving_error_retries_same_step() {
    let h = harness();
    let wf = import(&h, WorkflowStatus::Active).await;
    h.agent
        .script("draft", Err(AgentError::Failed("mail server unavailable".into())));

    let execution_id = h.state.orchestrator.start(&wf.id, None).await.unwrap();
    h.scheduler.run_until_idle().await;

    let pending = h.state.review_gate.pending(Some(&wf.id)).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action.action_type, ReviewActionType::Error);
    assert_eq!(pending[0].action.payload["stepLabel"], "Draft reminder");
    assert_eq!(h.state.orchestrator.state(&wf.id).unwrap().current_step_index, 1);

    let history = events(&h, &wf).await;
    assert!(has_update(&history, UpdateKind::StepFailed));
    assert_eq!(history.last().map(|e| e.as_str()), Some("review_needed"));
    let record = h.state.execution_store.get(&execution_id).await.unwrap().unwrap();
    assert!(record.error.unwrap().contains("mail server unavailable"));

    // Second attempt proposes nothing, so the step completes on retry.
    let outcome = h
        .state
        .review_gate
        .approve(&pending[0].id, ApprovalInput::default())
        .await
        .unwrap();
    assert_eq!(outcome, AdvanceOutcome::StepCompleted { index: 1 });
    assert_eq!(h.agent.calls_for("draft").len(), 2);
}

#[tokio::test]
async fn test_guidance_round_trip() {
    let h = harness();
    let wf = import(&h, WorkflowStatus::Active).await;
    h.agent
        .script("draft", Err(AgentError::GuidanceNeeded("Which tone?".into())));
    h.agent.script("draft", proposes("draft email"));

    h.state.orchestrator.start(&wf.id, None).await.unwrap();
    h.scheduler.run_until_idle().await;
    assert_eq!(
        h.state.orchestrator.state(&wf.id).unwrap().phase,
        ExecutionPhase::WaitingGuidance
    );

    let item = h
        .state
        .review_gate
        .provide_guidance(&wf.id, "draft", "Friendly but firm")
        .await
        .unwrap();
    assert!(item.needs_guidance);
    assert_eq!(item.chat_history.len(), 2);
    // Guidance alone does not resume.
    assert_eq!(
        h.state.orchestrator.state(&wf.id).unwrap().phase,
        ExecutionPhase::WaitingGuidance
    );

    let outcome = h
        .state
        .review_gate
        .approve(&item.id, ApprovalInput::default())
        .await
        .unwrap();
    assert!(matches!(outcome, AdvanceOutcome::Suspended { ref review }
        if review.action.action_type == ReviewActionType::ApprovalRequired));
    assert_eq!(h.agent.calls_for("draft"), vec![0, 1]);
    let snapshot = h.state.orchestrator.state(&wf.id).unwrap();
    assert_eq!(snapshot.guidance_context[0].chat_history.len(), 2);
}

async fn rename_table(h: &Harness, from: &'static str, to: &'static str) {
    h.state
        .db
        .with_conn_async(move |conn| {
            conn.execute_batch(&format!("ALTER TABLE {} RENAME TO {}", from, to))
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unrecorded_step_start_fails_and_releases_instance() {
    let h = harness();
    let wf = import(&h, WorkflowStatus::Active).await;
    h.state.orchestrator.start(&wf.id, None).await.unwrap();

    rename_table(&h, "executions", "executions_offline").await;
    let err = h.state.orchestrator.advance(&wf.id).await.unwrap_err();
    assert!(matches!(err, FlowError::Database(_)), "{:?}", err);

    let snapshot = h.state.orchestrator.state(&wf.id).unwrap();
    assert_eq!(snapshot.phase, ExecutionPhase::Failed);
    assert!(!snapshot.running);
    assert!(h.scheduler.pending().is_empty());
    assert!(has_update(&events(&h, &wf).await, UpdateKind::Failed));
    assert!(h.agent.calls_for("draft").is_empty());

    rename_table(&h, "executions_offline", "executions").await;
    h.state.orchestrator.start(&wf.id, None).await.unwrap();
}

#[tokio::test]
async fn test_unsaved_review_item_does_not_park_instance() {
    let h = harness();
    let wf = import(&h, WorkflowStatus::Active).await;
    h.agent.script("draft", proposes("draft email"));
    let execution_id = h.state.orchestrator.start(&wf.id, None).await.unwrap();

    rename_table(&h, "review_items", "review_items_offline").await;
    let err = h.state.orchestrator.advance(&wf.id).await.unwrap_err();
    assert!(matches!(err, FlowError::Database(_)), "{:?}", err);
    rename_table(&h, "review_items_offline", "review_items").await;

    let snapshot = h.state.orchestrator.state(&wf.id).unwrap();
    assert_eq!(snapshot.phase, ExecutionPhase::Failed);
    assert!(h.state.review_gate.pending(Some(&wf.id)).await.unwrap().is_empty());
    let record = h.state.execution_store.get(&execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error.unwrap().contains("Draft reminder"));
    assert!(!kinds(&events(&h, &wf).await).contains(&"review_needed"));

    let restarted = h.state.orchestrator.start(&wf.id, None).await.unwrap();
    assert_ne!(restarted, execution_id);
}

// ─── Reject / cancel ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_rejection_fails_execution() {
    let h = harness();
    let wf = import(&h, WorkflowStatus::Active).await;
    h.agent.script("draft", proposes("send payment link"));

    let execution_id = h.state.orchestrator.start(&wf.id, None).await.unwrap();
    h.scheduler.run_until_idle().await;
    let review = h.state.review_gate.pending(Some(&wf.id)).await.unwrap()[0].clone();
    assert_eq!(review.action.payload["actions"][0]["verdict"], "forbidden");

    h.state
        .review_gate
        .reject(&review.id, Some("Never send payment links".into()))
        .await
        .unwrap();

    assert!(h.state.review_gate.pending(Some(&wf.id)).await.unwrap().is_empty());
    assert_eq!(
        h.state.orchestrator.state(&wf.id).unwrap().phase,
        ExecutionPhase::Failed
    );
    let record = h.state.execution_store.get(&execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error.unwrap().contains("Never send payment links"));
    assert!(has_update(&events(&h, &wf).await, UpdateKind::Rejected));

    let err = h
        .state
        .review_gate
        .approve(&review.id, ApprovalInput::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Conflict(_)));

    // A rejected run needs a fresh start.
    let restarted = h.state.orchestrator.start(&wf.id, None).await.unwrap();
    assert_ne!(restarted, execution_id);
}

#[tokio::test]
async fn test_cancel_is_final() {
    let h = harness();
    let wf = import(&h, WorkflowStatus::Active).await;

    let execution_id = h.state.orchestrator.start(&wf.id, None).await.unwrap();
    assert_eq!(h.scheduler.pending(), vec![wf.id.clone()]);

    assert!(h.state.orchestrator.cancel(&wf.id).await.unwrap());
    assert!(h.scheduler.pending().is_empty());
    assert_eq!(h.scheduler.run_until_idle().await, 0);
    assert!(!h.state.orchestrator.cancel(&wf.id).await.unwrap());

    assert_eq!(
        h.state.orchestrator.advance(&wf.id).await.unwrap(),
        AdvanceOutcome::Idle
    );
    let snapshot = h.state.orchestrator.state(&wf.id).unwrap();
    assert_eq!(snapshot.phase, ExecutionPhase::Cancelled);
    assert_eq!(snapshot.current_step_index, 1);

    let record = h.state.execution_store.get(&execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert!(has_update(&events(&h, &wf).await, UpdateKind::Cancelled));
}

#[tokio::test]
async fn test_cancel_while_waiting_closes_review() {
    let h = harness();
    let wf = import(&h, WorkflowStatus::Active).await;
    h.agent.script("draft", proposes("draft email"));
    h.state.orchestrator.start(&wf.id, None).await.unwrap();
    h.scheduler.run_until_idle().await;
    let review = h.state.review_gate.pending(Some(&wf.id)).await.unwrap()[0].clone();

    assert!(h.state.orchestrator.cancel(&wf.id).await.unwrap());

    let stored = h.state.review_gate.get(&review.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ReviewStatus::Cancelled);
    let err = h
        .state
        .review_gate
        .approve(&review.id, ApprovalInput::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Conflict(_)));
    assert_eq!(
        h.state.orchestrator.state(&wf.id).unwrap().phase,
        ExecutionPhase::Cancelled
    );
}

// ─── Resume signal ────────────────────────────────────────────────────────

#[derive(Default)]
struct UnreachableEngine {
    delivered: Mutex<Vec<ResumePayload>>,
}

#[async_trait]
impl ResumeSignal for UnreachableEngine {
    async fn deliver(&self, payload: &ResumePayload) -> Result<(), String> {
        self.delivered.lock().unwrap().push(payload.clone());
        Err("connection refused".to_string())
    }
}

#[tokio::test]
async fn test_resume_signal_failure_does_not_block_approval() {
    let h = harness();
    let wf = import(&h, WorkflowStatus::Active).await;
    h.agent.script("draft", proposes("draft email"));
    h.state.orchestrator.start(&wf.id, Some("Night Shift".into())).await.unwrap();
    h.scheduler.run_until_idle().await;

    let engine = Arc::new(UnreachableEngine::default());
    let gate = h.state.review_gate.clone().with_resume_signal(engine.clone());
    let review = gate.pending(Some(&wf.id)).await.unwrap()[0].clone();
    assert_eq!(review.assignee, "Night Shift");

    let input = ApprovalInput {
        reviewer_notes: Some("Looks good".into()),
        response_data: Some(serde_json::json!({ "subject": "Reminder" })),
    };
    gate.approve(&review.id, input).await.unwrap();

    let delivered = engine.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].approved);
    assert_eq!(delivered[0].review_id, review.id);
    assert_eq!(delivered[0].reviewer_notes.as_deref(), Some("Looks good"));

    let stored = h.state.review_store.get(&review.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ReviewStatus::Approved);
    assert_eq!(stored.reviewer_notes.as_deref(), Some("Looks good"));
}
