//! skein - durable workflows for Rust.
//!
//! Workflows are plain async functions that run from the top on every
//! wake-up. Activities, timers, event waits and child workflows go through
//! the [`WorkflowContext`](skein_core::workflow::WorkflowContext), which
//! records each call site once and replays it from history afterwards.

mod runtime;

#[doc(hidden)]
pub use skein_core;
#[doc(hidden)]
pub use skein_runtime;

pub use runtime::prelude;
pub use runtime::{init_tracing, Skein, SkeinBuilder};
