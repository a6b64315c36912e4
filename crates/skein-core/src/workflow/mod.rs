mod activity;
mod context;
pub mod key;
mod queue;
mod state;
mod step;
mod step_runner;
mod suspend;
mod traits;

pub use activity::{
    Activity, ActivityContext, ActivityDescriptor, ActivityInfo, ActivitySet, ActivityTable,
    BoxedActivityHandler, RegisteredActivity, ServiceRequirement, Services,
};
pub use context::{
    child_workflow_id, ExecutionMode, QueueOutcome, ResolvedStep, WorkflowContext,
};
pub use key::KeyMode;
pub use queue::{QueueToken, WorkflowQueueItem};
pub use state::{WorkflowSnapshot, WorkflowStep};
pub use step::{ActivityKey, ActivityKind, ActivityStatus, ActivityStep};
pub use step_runner::ActivityCall;
pub use suspend::{EventResult, Resolution};
pub use traits::{Workflow, WorkflowInfo, WorkflowStatus};
