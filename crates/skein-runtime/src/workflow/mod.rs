mod engine;
mod registry;
mod scheduler;

pub use engine::{DispatchOutcome, ReplayReport, WorkflowEngine};
pub use registry::{BoxedWorkflowHandler, WorkflowEntry, WorkflowRegistry};
pub use scheduler::WorkflowScheduler;
