pub mod assertion;
pub mod execution;
pub mod review;
pub mod test_run;
pub mod workflow;

pub use assertion::*;
pub use execution::*;
pub use review::*;
pub use test_run::*;
pub use workflow::*;
