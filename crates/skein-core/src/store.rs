//! Storage contract of the scheduling core.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::workflow::{ActivityKey, ActivityStep, QueueToken, WorkflowQueueItem, WorkflowStep};
use crate::{Result, SkeinError};

/// Exclusive lock on one history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLock {
    pub workflow_id: String,
    pub sequence_id: i64,
    /// Distinguishes this holder from earlier holders of an expired lock.
    pub holder: uuid::Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Persistence, queueing and locking for workflows.
///
/// Implementations must be safe to share between concurrent dispatches and
/// between processes pointed at the same backend.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    /// Insert a workflow. Fails with `Conflict` if the ID exists.
    async fn insert_workflow(&self, workflow: &WorkflowStep) -> Result<()>;

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowStep>>;

    /// Overwrite a workflow unless its stored status is already terminal.
    ///
    /// Returns `false` when the write was refused for that reason.
    async fn update_workflow(&self, workflow: &WorkflowStep) -> Result<bool>;

    /// Insert a history entry and assign its sequence number.
    ///
    /// Fails with `Conflict` if an entry with the same key already exists.
    async fn insert_activity(&self, step: &ActivityStep) -> Result<ActivityStep>;

    async fn get_activity(
        &self,
        workflow_id: &str,
        key: &ActivityKey,
    ) -> Result<Option<ActivityStep>>;

    async fn update_activity(&self, step: &ActivityStep) -> Result<()>;

    /// History of a workflow ordered by sequence number.
    async fn list_activities(&self, workflow_id: &str) -> Result<Vec<ActivityStep>>;

    /// The outstanding event wait of a workflow that listens for `event_name`.
    async fn get_event(&self, workflow_id: &str, event_name: &str)
        -> Result<Option<ActivityStep>>;

    /// Register a wake-up at `due`, replacing `existing` if given.
    async fn enqueue_wakeup(
        &self,
        workflow_id: &str,
        due: DateTime<Utc>,
        existing: Option<&QueueToken>,
    ) -> Result<QueueToken>;

    /// Remove wake-ups. Unknown tokens are ignored.
    async fn remove_wakeups(&self, tokens: &[QueueToken]) -> Result<()>;

    /// Lease up to `limit` wake-ups due at `now`.
    ///
    /// A leased item is not handed out again until `lease` has passed.
    async fn due_wakeups(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<WorkflowQueueItem>>;

    /// Wake-ups of a workflow that have not been removed yet.
    async fn pending_wakeups(&self, workflow_id: &str) -> Result<Vec<WorkflowQueueItem>>;

    /// Try to lock a history entry. `None` means someone else holds it.
    async fn acquire_lock(
        &self,
        workflow_id: &str,
        sequence_id: i64,
        ttl: Duration,
    ) -> Result<Option<StepLock>>;

    async fn release_lock(&self, lock: &StepLock) -> Result<()>;
}

/// Acquire a step lock, backing off between attempts.
pub async fn lock_step(
    store: &dyn WorkflowStore,
    workflow_id: &str,
    sequence_id: i64,
    config: &EngineConfig,
) -> Result<StepLock> {
    for attempt in 0..config.lock_retry_attempts {
        if let Some(lock) = store
            .acquire_lock(workflow_id, sequence_id, config.lock_ttl())
            .await?
        {
            return Ok(lock);
        }

        let backoff = config.lock_backoff(attempt);
        tracing::trace!(
            workflow_id = %workflow_id,
            sequence_id,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            "Step lock busy"
        );
        tokio::time::sleep(backoff).await;
    }

    Err(SkeinError::LockUnavailable(format!(
        "step {} of workflow {} still locked after {} attempts",
        sequence_id, workflow_id, config.lock_retry_attempts
    )))
}

/// Persist a new workflow together with its first wake-up.
pub async fn schedule_workflow(
    store: &dyn WorkflowStore,
    mut workflow: WorkflowStep,
    due: DateTime<Utc>,
) -> Result<WorkflowStep> {
    store.insert_workflow(&workflow).await?;
    ensure_wakeup(store, &mut workflow, due).await?;
    Ok(workflow)
}

/// Give a running workflow without a wake-up its first one.
///
/// Covers a process that stopped between writing the workflow record and
/// enqueueing its dispatch.
pub async fn ensure_wakeup(
    store: &dyn WorkflowStore,
    workflow: &mut WorkflowStep,
    due: DateTime<Utc>,
) -> Result<()> {
    if workflow.queue_token.is_some() || workflow.status.is_terminal() {
        return Ok(());
    }
    let token = store.enqueue_wakeup(&workflow.id, due, None).await?;
    workflow.queue_token = Some(token);
    store.update_workflow(workflow).await?;
    Ok(())
}
