//! Core types of the skein workflow engine: the data model, the storage and
//! clock contracts, and the authoring surface workflows are written against.

pub mod clock;
pub mod config;
pub mod error;
pub mod store;
pub mod workflow;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::{DatabaseConfig, EngineConfig, ObservabilityConfig, SkeinConfig};
pub use error::{Result, SkeinError};
pub use store::{StepLock, WorkflowStore};
pub use workflow::{
    Activity, ActivityCall, ActivityContext, ActivityInfo, ActivityKey, ActivityKind, ActivitySet,
    ActivityStatus, ActivityStep, EventResult, KeyMode, QueueToken, Services, Workflow,
    WorkflowContext, WorkflowInfo, WorkflowQueueItem, WorkflowSnapshot, WorkflowStatus,
    WorkflowStep,
};
