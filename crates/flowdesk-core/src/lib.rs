//! Flowdesk Core - execution engine for AI-assisted business workflows.
//!
//! This crate runs workflow definitions step by step, suspends them for
//! human review or guidance, resumes them on reviewer decisions, and replays
//! them against mock data in test runs scored by declarative assertions.
//! It has no UI or HTTP dependency, making it suitable for use in:
//!
//! - CLI tools (via `flowdesk-cli`)
//! - Dashboard backends that subscribe to the event bus
//! - Automation engines that wait on review decisions
//!
//! External collaborators are traits: [`executor::AgentCapability`] (the
//! LLM-backed agent), [`review::ResumeSignal`] (a system waiting on a review)
//! and [`scheduler::Scheduler`] (inter-step continuations).

pub mod assertion;
pub mod blueprint;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod executor;
pub mod models;
pub mod orchestrator;
pub mod review;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod test_run;

// Convenience re-exports
pub use config::FlowdeskConfig;
pub use db::Database;
pub use error::FlowError;
pub use events::{EventBus, WorkflowEvent};
pub use orchestrator::{AdvanceOutcome, Orchestrator};
pub use review::ReviewGate;
pub use state::{AppState, AppStateInner};
pub use test_run::TestRunCoordinator;
