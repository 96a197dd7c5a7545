//! Test-Run Coordinator - replays a workflow's steps against mock data and
//! scores the result with the assertion engine.
//!
//! `pending → running → {passed | failed | error | cancelled}`. Each step
//! gets a result record before it runs and again when it finishes, so a
//! poller sees progress mid-run. A failing step aborts the run with `error`
//! and no assertions are evaluated; `failed` means every step ran but an
//! assertion did not hold.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::assertion::AssertionEngine;
use crate::db::Database;
use crate::error::FlowError;
use crate::models::assertion::TestAssertion;
use crate::models::execution::{Execution, ExecutionStatus};
use crate::models::test_run::{
    MockInput, MockResponse, StepResultStatus, TestCase, TestRun, TestRunStatus, TestStepResult,
};
use crate::models::workflow::{Workflow, WorkflowStep};
use crate::store::{ExecutionStore, TestRunStore};

/// Produces a step's output during a test run.
#[async_trait]
pub trait StepSimulator: Send + Sync {
    async fn simulate(
        &self,
        step: &WorkflowStep,
        input: &Value,
        mock: &MockInput,
    ) -> Result<Value, String>;
}

/// Answers from the mock responses, else a synthetic completion record.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockStepSimulator;

#[async_trait]
impl StepSimulator for MockStepSimulator {
    async fn simulate(
        &self,
        step: &WorkflowStep,
        input: &Value,
        mock: &MockInput,
    ) -> Result<Value, String> {
        match mock.responses.get(&step.id) {
            Some(MockResponse::Output(output)) => Ok(output.clone()),
            Some(MockResponse::Error(error)) => Err(error.clone()),
            None => Ok(json!({
                "stepId": step.id,
                "label": step.label,
                "type": step.step_type.as_str(),
                "status": "completed",
                "input": input,
            })),
        }
    }
}

#[derive(Clone)]
pub struct TestRunCoordinator {
    runs: TestRunStore,
    executions: ExecutionStore,
    engine: AssertionEngine,
    simulator: Arc<dyn StepSimulator>,
}

impl TestRunCoordinator {
    pub fn new(db: Database, engine: AssertionEngine) -> Self {
        Self::with_simulator(db, engine, Arc::new(MockStepSimulator))
    }

    pub fn with_simulator(
        db: Database,
        engine: AssertionEngine,
        simulator: Arc<dyn StepSimulator>,
    ) -> Self {
        Self {
            runs: TestRunStore::new(db.clone()),
            executions: ExecutionStore::new(db),
            engine,
            simulator,
        }
    }

    pub async fn get(&self, run_id: &str) -> Result<Option<TestRun>, FlowError> {
        self.runs.get(run_id).await
    }

    pub async fn steps(&self, run_id: &str) -> Result<Vec<TestStepResult>, FlowError> {
        self.runs.list_steps(run_id).await
    }

    /// Record a new pending run.
    pub async fn create(
        &self,
        workflow: &Workflow,
        test_case_id: Option<String>,
    ) -> Result<TestRun, FlowError> {
        let run = TestRun {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            test_case_id,
            execution_id: None,
            status: TestRunStatus::Pending,
            failed_step_id: None,
            error: None,
            total_assertions: 0,
            passed_assertions: 0,
            failed_assertions: 0,
            results: Vec::new(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_at: Utc::now(),
        };
        self.runs.save(&run).await?;
        Ok(run)
    }

    /// Create and execute a run for a saved test case.
    pub async fn run(&self, workflow: &Workflow, case: &TestCase) -> Result<TestRun, FlowError> {
        let run = self.create(workflow, Some(case.id.clone())).await?;
        self.execute(&run.id, workflow, &case.mock_input(), &case.assertions)
            .await
    }

    /// Execute a pending run to a terminal status.
    pub async fn execute(
        &self,
        run_id: &str,
        workflow: &Workflow,
        mock: &MockInput,
        assertions: &[TestAssertion],
    ) -> Result<TestRun, FlowError> {
        let mut run = self
            .runs
            .get(run_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("Test run {} not found", run_id)))?;
        if run.status != TestRunStatus::Pending {
            return Err(FlowError::Conflict(format!(
                "Test run {} is already {}",
                run_id,
                run.status.as_str()
            )));
        }

        // Only the caller that wins the claim creates an execution.
        if !self
            .runs
            .transition(run_id, TestRunStatus::Pending, TestRunStatus::Running)
            .await?
        {
            let current = self.reload(run_id).await?;
            return Err(FlowError::Conflict(format!(
                "Test run {} is already {}",
                run_id,
                current.status.as_str()
            )));
        }
        run.status = TestRunStatus::Running;

        let mut execution = Execution::new(&workflow.id, ExecutionStatus::Running);
        execution.test_run_id = Some(run.id.clone());
        self.executions.save(&execution).await?;

        let started = Instant::now();
        run.execution_id = Some(execution.id.clone());
        run.started_at = Some(execution.started_at);
        self.runs
            .set_execution(run_id, &execution.id, execution.started_at)
            .await?;
        tracing::info!(
            "[TestRun] Running {} against '{}' ({} steps, {} assertions)",
            run.id,
            workflow.name,
            workflow.steps.len(),
            assertions.len()
        );

        let steps = workflow.ordered_steps();
        let mut step_outputs: HashMap<String, Value> = HashMap::new();
        let mut input = mock.input.clone();

        for (position, step) in steps.iter().enumerate() {
            if self.is_cancelled(run_id).await? {
                tracing::info!("[TestRun] {} cancelled before '{}'", run_id, step.label);
                return self.abandon(run_id, &execution.id).await;
            }

            let mut result = TestStepResult {
                id: uuid::Uuid::new_v4().to_string(),
                test_run_id: run.id.clone(),
                step_id: step.id.clone(),
                step_label: step.label.clone(),
                step_order: step.order,
                status: StepResultStatus::Running,
                input: input.clone(),
                output: None,
                error: None,
                started_at: Utc::now(),
                duration_ms: None,
            };
            self.runs.save_step(&result).await?;
            self.executions
                .update_status(&execution.id, ExecutionStatus::Running, Some(step.id.clone()), None)
                .await?;

            let step_started = Instant::now();
            let outcome = self.simulator.simulate(step, &input, mock).await;
            result.duration_ms = Some(step_started.elapsed().as_millis() as i64);

            match outcome {
                Ok(output) => {
                    result.status = StepResultStatus::Completed;
                    result.output = Some(output.clone());
                    self.runs.save_step(&result).await?;
                    step_outputs.insert(step.id.clone(), output.clone());
                    input = output;
                }
                Err(error) => {
                    result.status = StepResultStatus::Failed;
                    result.error = Some(error.clone());
                    self.runs.save_step(&result).await?;
                    self.skip_remaining(&run.id, &steps[position + 1..], &input)
                        .await?;

                    run.status = TestRunStatus::Error;
                    run.failed_step_id = Some(step.id.clone());
                    run.error = Some(format!("Step '{}' failed: {}", step.label, error));
                    return self
                        .finish(run, started, &execution.id, ExecutionStatus::Failed)
                        .await;
                }
            }
        }

        if self.is_cancelled(run_id).await? {
            return self.abandon(run_id, &execution.id).await;
        }

        // Final output is the last step's output, or the test input when
        // the workflow has no steps.
        let final_output = input;
        let summary = self
            .engine
            .evaluate_all(assertions, &final_output, &step_outputs);
        run.status = if summary.failed > 0 {
            TestRunStatus::Failed
        } else {
            TestRunStatus::Passed
        };
        run.total_assertions = summary.total;
        run.passed_assertions = summary.passed;
        run.failed_assertions = summary.failed;
        run.results = summary.results;
        self.finish(run, started, &execution.id, ExecutionStatus::Completed)
            .await
    }

    /// Cancel a running test run and its linked execution. Only a `running`
    /// run can be cancelled.
    pub async fn cancel(&self, run_id: &str) -> Result<bool, FlowError> {
        if !self
            .runs
            .transition(run_id, TestRunStatus::Running, TestRunStatus::Cancelled)
            .await?
        {
            return Ok(false);
        }
        if let Some(mut run) = self.runs.get(run_id).await? {
            let now = Utc::now();
            run.completed_at = Some(now);
            run.duration_ms = run.started_at.map(|s| (now - s).num_milliseconds());
            self.runs.save(&run).await?;
            if let Some(execution_id) = &run.execution_id {
                self.executions
                    .update_status(execution_id, ExecutionStatus::Cancelled, None, None)
                    .await?;
            }
        }
        tracing::info!("[TestRun] Cancelled {}", run_id);
        Ok(true)
    }

    async fn finish(
        &self,
        mut run: TestRun,
        started: Instant,
        execution_id: &str,
        execution_status: ExecutionStatus,
    ) -> Result<TestRun, FlowError> {
        // A cancel that landed first wins.
        if !self
            .runs
            .transition(&run.id, TestRunStatus::Running, run.status)
            .await?
        {
            return self.reload(&run.id).await;
        }
        run.completed_at = Some(Utc::now());
        run.duration_ms = Some(started.elapsed().as_millis() as i64);
        self.runs.save(&run).await?;
        self.executions
            .update_status(execution_id, execution_status, None, run.error.clone())
            .await?;

        tracing::info!(
            "[TestRun] {} finished {} ({}/{} assertions passed)",
            run.id,
            run.status.as_str(),
            run.passed_assertions,
            run.total_assertions
        );
        Ok(run)
    }

    async fn skip_remaining(
        &self,
        run_id: &str,
        steps: &[WorkflowStep],
        input: &Value,
    ) -> Result<(), FlowError> {
        for step in steps {
            self.runs
                .save_step(&TestStepResult {
                    id: uuid::Uuid::new_v4().to_string(),
                    test_run_id: run_id.to_string(),
                    step_id: step.id.clone(),
                    step_label: step.label.clone(),
                    step_order: step.order,
                    status: StepResultStatus::Skipped,
                    input: input.clone(),
                    output: None,
                    error: None,
                    started_at: Utc::now(),
                    duration_ms: None,
                })
                .await?;
        }
        Ok(())
    }

    async fn is_cancelled(&self, run_id: &str) -> Result<bool, FlowError> {
        Ok(self
            .runs
            .get(run_id)
            .await?
            .is_some_and(|r| r.status == TestRunStatus::Cancelled))
    }

    /// Close the execution of a run that was cancelled mid-flight. The cancel
    /// may have landed before the execution was linked to the run.
    async fn abandon(&self, run_id: &str, execution_id: &str) -> Result<TestRun, FlowError> {
        self.executions
            .update_status(execution_id, ExecutionStatus::Cancelled, None, None)
            .await?;
        self.reload(run_id).await
    }

    async fn reload(&self, run_id: &str) -> Result<TestRun, FlowError> {
        self.runs
            .get(run_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("Test run {} not found", run_id)))
    }
}
