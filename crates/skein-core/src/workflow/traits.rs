use std::future::Future;
use std::str::FromStr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::activity::ActivitySet;
use super::context::WorkflowContext;
use crate::{Result, SkeinError};

/// Trait for workflow definitions.
///
/// A fresh instance is created with `Default` for every dispatch and its
/// `execute` method runs from the top; everything with side effects must go
/// through the [`WorkflowContext`].
pub trait Workflow: Default + Send + Sync + 'static {
    /// Input type for the workflow.
    type Input: DeserializeOwned + Serialize + Send + Sync;
    /// Output type for the workflow.
    type Output: DeserializeOwned + Serialize + Send;

    /// Get workflow metadata.
    fn info() -> WorkflowInfo;

    /// Declare the activities this workflow may call.
    fn activities(_activities: &mut ActivitySet) {}

    /// Execute the workflow.
    fn execute(
        &self,
        ctx: &WorkflowContext,
        input: Self::Input,
    ) -> impl Future<Output = Result<Self::Output>> + Send;
}

/// Workflow metadata.
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    /// Workflow type name, stored on every instance.
    pub name: &'static str,
    /// Workflow version.
    pub version: u32,
}

impl WorkflowInfo {
    pub fn new(name: &'static str) -> Self {
        Self { name, version: 1 }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

/// Workflow execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Due for dispatch or currently dispatching.
    Running,
    /// Waiting durably for a future wake-up.
    Suspended,
    /// Workflow completed successfully.
    Completed,
    /// Workflow failed.
    Failed,
}

impl WorkflowStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Check if the workflow is terminal (no longer running).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for WorkflowStatus {
    type Err = SkeinError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SkeinError::Deserialization(format!(
                "unknown workflow status '{}'",
                other
            ))),
        }
    }
}
