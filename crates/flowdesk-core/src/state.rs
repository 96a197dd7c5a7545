//! Shared application state for the CLI and embedders.

use std::sync::Arc;

use crate::assertion::AssertionEngine;
use crate::blueprint::BlueprintEvaluator;
use crate::config::FlowdeskConfig;
use crate::db::Database;
use crate::events::EventBus;
use crate::executor::{AgentCapability, StepExecutor};
use crate::orchestrator::{ExecutionStateStore, Orchestrator};
use crate::review::ReviewGate;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::store::{ExecutionStore, ReviewStore, TestRunStore, WorkflowStore};
use crate::test_run::TestRunCoordinator;

/// Everything a caller needs to run and review workflows.
pub struct AppStateInner {
    pub db: Database,
    pub config: FlowdeskConfig,
    pub workflow_store: WorkflowStore,
    pub execution_store: ExecutionStore,
    pub review_store: ReviewStore,
    pub test_run_store: TestRunStore,
    pub event_bus: EventBus,
    pub execution_states: ExecutionStateStore,
    pub orchestrator: Orchestrator,
    pub review_gate: ReviewGate,
    pub test_runs: TestRunCoordinator,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn new(db: Database, config: FlowdeskConfig, agent: Arc<dyn AgentCapability>) -> Self {
        Self::with_scheduler(db, config, agent, Arc::new(TokioScheduler::new()))
    }

    pub fn with_scheduler(
        db: Database,
        config: FlowdeskConfig,
        agent: Arc<dyn AgentCapability>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let event_bus = EventBus::with_limits(
            config.events.channel_capacity,
            config.events.history_limit,
        );
        let execution_states = ExecutionStateStore::new();
        let executor = StepExecutor::new(
            agent,
            BlueprintEvaluator::new(config.blueprint.default_policy),
        );
        let orchestrator = Orchestrator::new(
            db.clone(),
            execution_states.clone(),
            executor,
            event_bus.clone(),
            scheduler,
            config.orchestrator.clone(),
        );
        let review_store = ReviewStore::new(db.clone());
        Self {
            workflow_store: WorkflowStore::new(db.clone()),
            execution_store: ExecutionStore::new(db.clone()),
            test_run_store: TestRunStore::new(db.clone()),
            review_gate: ReviewGate::new(orchestrator.clone(), review_store.clone()),
            test_runs: TestRunCoordinator::new(db.clone(), AssertionEngine::new()),
            review_store,
            orchestrator,
            execution_states,
            event_bus,
            config,
            db,
        }
    }
}
