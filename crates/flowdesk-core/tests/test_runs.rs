//! Integration tests for the test-run coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use flowdesk_core::assertion::AssertionEngine;
use flowdesk_core::models::execution::ExecutionStatus;
use flowdesk_core::models::test_run::{MockInput, StepResultStatus, TestCase, TestRunStatus};
use flowdesk_core::models::workflow::{Workflow, WorkflowStep};
use flowdesk_core::store::ExecutionStore;
use flowdesk_core::test_run::{MockStepSimulator, StepSimulator, TestRunCoordinator};
use flowdesk_core::{Database, FlowError};

const WORKFLOW: &str = r#"
id: reminder
name: "Reminder"
steps:
  - { id: fetch, label: "Fetch invoice", type: trigger }
  - { id: draft, label: "Draft email", type: action }
  - { id: send, label: "Send email", type: action }
"#;

fn setup() -> (Database, TestRunCoordinator, Workflow) {
    let db = Database::open(":memory:").expect("Failed to open in-memory database");
    let coordinator = TestRunCoordinator::new(db.clone(), AssertionEngine::new());
    (db, coordinator, Workflow::from_yaml(WORKFLOW).unwrap())
}

#[tokio::test]
async fn test_passing_case_records_every_step() {
    let (db, coordinator, wf) = setup();
    let case = TestCase::from_yaml(
        r#"
name: "reminder goes out"
input: { invoiceId: "INV-7" }
mockResponses:
  draft:
    output: { subject: "Reminder", to: ["ap@client.io"] }
  send:
    output: { status: "sent" }
assertions:
  - { name: "final status", path: status, type: equals, expectedValue: sent }
  - { name: "one recipient", stepId: draft, path: to, type: hasLength, expectedValue: "1" }
  - { name: "fetch saw input", stepId: fetch, path: "input.invoiceId", type: equals, expectedValue: "INV-7" }
"#,
    )
    .unwrap();

    let run = coordinator.run(&wf, &case).await.unwrap();
    assert_eq!(run.status, TestRunStatus::Passed, "{:?}", run.results);
    assert_eq!(run.total_assertions, 3);
    assert_eq!(run.passed_assertions, 3);
    assert_eq!(run.test_case_id.as_deref(), Some(case.id.as_str()));
    assert!(run.duration_ms.is_some());

    let steps = coordinator.steps(&run.id).await.unwrap();
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|s| s.status == StepResultStatus::Completed));
    // Each step receives the previous step's output.
    assert_eq!(steps[2].input, json!({ "subject": "Reminder", "to": ["ap@client.io"] }));

    let execution = ExecutionStore::new(db)
        .get(run.execution_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.test_run_id.as_deref(), Some(run.id.as_str()));
}

#[tokio::test]
async fn test_failed_assertion_marks_run_failed() {
    let (_db, coordinator, wf) = setup();
    let case = TestCase::from_yaml(
        r#"
name: "still pending"
mockResponses:
  send: { output: { status: "pending" } }
assertions:
  - { name: "sent", path: status, type: equals, expectedValue: sent }
  - { name: "bogus", path: status, type: isPrime }
"#,
    )
    .unwrap();

    let run = coordinator.run(&wf, &case).await.unwrap();
    assert_eq!(run.status, TestRunStatus::Failed);
    assert_eq!(run.failed_assertions, 2);
    assert_eq!(run.total_assertions, run.passed_assertions + run.failed_assertions);
    assert_eq!(run.results[0].actual_value, Some(json!("pending")));
    assert_eq!(run.results[0].expected_value, Some(json!("sent")));
    assert!(run.failed_step_id.is_none());
}

#[tokio::test]
async fn test_step_failure_is_error_without_assertions() {
    let (db, coordinator, wf) = setup();
    let case = TestCase::from_yaml(
        r#"
name: "draft blows up"
mockResponses:
  draft: { error: "template missing" }
assertions:
  - { name: "sent", path: status, type: equals, expectedValue: sent }
"#,
    )
    .unwrap();

    let run = coordinator.run(&wf, &case).await.unwrap();
    assert_eq!(run.status, TestRunStatus::Error);
    assert_eq!(run.failed_step_id.as_deref(), Some("draft"));
    assert!(run.error.as_deref().unwrap().contains("template missing"));
    assert!(run.results.is_empty());
    assert_eq!(run.total_assertions, 0);

    let statuses: Vec<_> = coordinator
        .steps(&run.id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.step_id, s.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("fetch".to_string(), StepResultStatus::Completed),
            ("draft".to_string(), StepResultStatus::Failed),
            ("send".to_string(), StepResultStatus::Skipped),
        ]
    );

    let execution = ExecutionStore::new(db)
        .get(run.execution_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_empty_workflow_asserts_against_input() {
    let (_db, coordinator, _) = setup();
    let wf = Workflow::from_yaml("name: \"Empty\"\nsteps: []\n").unwrap();
    let run = coordinator.create(&wf, None).await.unwrap();
    assert_eq!(run.status, TestRunStatus::Pending);

    let assertions = TestCase::from_yaml(
        "name: x\nassertions:\n  - { name: flag, path: \"$.ready\", type: isTrue }\n",
    )
    .unwrap()
    .assertions;
    let mock = MockInput {
        input: json!({ "ready": "true" }),
        ..Default::default()
    };
    let run = coordinator
        .execute(&run.id, &wf, &mock, &assertions)
        .await
        .unwrap();
    assert_eq!(run.status, TestRunStatus::Passed);

    // A finished run cannot be executed again.
    let err = coordinator
        .execute(&run.id, &wf, &mock, &assertions)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Conflict(_)));
}

#[tokio::test]
async fn test_concurrent_execute_creates_one_execution() {
    let (db, coordinator, wf) = setup();
    let run = coordinator.create(&wf, None).await.unwrap();
    let mock = MockInput::default();

    let (first, second) = tokio::join!(
        coordinator.execute(&run.id, &wf, &mock, &[]),
        coordinator.execute(&run.id, &wf, &mock, &[]),
    );
    let (winner, loser) = match (first, second) {
        (Ok(run), Err(err)) | (Err(err), Ok(run)) => (run, err),
        other => panic!("expected exactly one execution, got {:?}", other),
    };
    assert!(matches!(loser, FlowError::Conflict(_)), "{:?}", loser);
    assert_eq!(winner.status, TestRunStatus::Passed);

    let executions = ExecutionStore::new(db).list_by_workflow(&wf.id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].test_run_id.as_deref(), Some(run.id.as_str()));
    assert_eq!(winner.execution_id.as_deref(), Some(executions[0].id.as_str()));
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
}

/// Blocks on the `draft` step until released.
struct GatedSimulator {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl StepSimulator for GatedSimulator {
    async fn simulate(
        &self,
        step: &WorkflowStep,
        input: &Value,
        mock: &MockInput,
    ) -> Result<Value, String> {
        if step.id == "draft" {
            self.entered.notify_one();
            self.release.notified().await;
        }
        MockStepSimulator.simulate(step, input, mock).await
    }
}

#[tokio::test]
async fn test_cancel_is_cooperative() {
    let db = Database::open(":memory:").unwrap();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let coordinator = TestRunCoordinator::with_simulator(
        db.clone(),
        AssertionEngine::new(),
        Arc::new(GatedSimulator {
            entered: entered.clone(),
            release: release.clone(),
        }),
    );
    let wf = Workflow::from_yaml(WORKFLOW).unwrap();
    let run = coordinator.create(&wf, None).await.unwrap();

    // Pending runs cannot be cancelled.
    assert!(!coordinator.cancel(&run.id).await.unwrap());

    let task = {
        let coordinator = coordinator.clone();
        let wf = wf.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move {
            coordinator
                .execute(&run_id, &wf, &MockInput::default(), &[])
                .await
        })
    };

    entered.notified().await;
    assert!(coordinator.cancel(&run.id).await.unwrap());
    assert!(!coordinator.cancel(&run.id).await.unwrap());
    release.notify_one();

    let finished = task.await.unwrap().unwrap();
    assert_eq!(finished.status, TestRunStatus::Cancelled);
    let steps = coordinator.steps(&run.id).await.unwrap();
    assert!(steps.iter().all(|s| s.step_id != "send"));

    let execution = ExecutionStore::new(db)
        .get(finished.execution_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
}
