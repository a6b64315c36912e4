use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::queue::QueueToken;
use super::traits::WorkflowStatus;

/// Root record of a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Globally unique workflow ID.
    pub id: String,
    /// Registered workflow type name.
    pub workflow_type: String,
    pub input: serde_json::Value,
    pub status: WorkflowStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Seed of the logical clock while running; completion time once terminal.
    pub last_updated: DateTime<Utc>,
    /// Wake-up the workflow is currently waiting on.
    pub queue_token: Option<QueueToken>,
}

impl WorkflowStep {
    /// Create a new running workflow record.
    pub fn new(
        id: impl Into<String>,
        workflow_type: impl Into<String>,
        input: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            workflow_type: workflow_type.into(),
            input,
            status: WorkflowStatus::Running,
            result: None,
            error: None,
            created_at: now,
            last_updated: now,
            queue_token: None,
        }
    }

    /// Mark as completed.
    pub fn complete(&mut self, result: serde_json::Value, at: DateTime<Utc>) {
        self.status = WorkflowStatus::Completed;
        self.result = Some(result);
        self.last_updated = at;
        self.queue_token = None;
    }

    /// Mark as suspended on `token`. The logical clock seed is left alone so
    /// the next replay starts from the same instant.
    pub fn suspend(&mut self, token: Option<QueueToken>) {
        self.status = WorkflowStatus::Suspended;
        self.queue_token = token;
    }

    /// Make the workflow due again on `token`.
    pub fn resume(&mut self, token: QueueToken) {
        if !self.status.is_terminal() {
            self.status = WorkflowStatus::Running;
            self.queue_token = Some(token);
        }
    }

    /// Mark as failed.
    pub fn fail(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = WorkflowStatus::Failed;
        self.error = Some(error.into());
        self.last_updated = at;
        self.queue_token = None;
    }

    /// Initial logical time of every execution.
    ///
    /// `last_updated` is only overwritten once the workflow is terminal, so
    /// replaying a finished workflow starts from its creation time.
    pub fn clock_seed(&self) -> DateTime<Utc> {
        if self.status.is_terminal() {
            self.created_at
        } else {
            self.last_updated
        }
    }

    /// Status view for callers.
    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            id: self.id.clone(),
            workflow_type: self.workflow_type.clone(),
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            last_updated: self.last_updated,
        }
    }
}

/// Result of a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}
