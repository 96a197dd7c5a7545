pub mod execution_store;
pub mod review_store;
pub mod test_run_store;
pub mod workflow_store;

pub use execution_store::ExecutionStore;
pub use review_store::ReviewStore;
pub use test_run_store::TestRunStore;
pub use workflow_store::WorkflowStore;
