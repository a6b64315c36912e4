//! Scheduling core and storage backends of the skein workflow engine.

pub mod storage;
pub mod workflow;

pub use storage::{MemoryStore, MigrationRunner, PgStore};
pub use workflow::{
    DispatchOutcome, ReplayReport, WorkflowEngine, WorkflowEntry, WorkflowRegistry,
    WorkflowScheduler,
};
