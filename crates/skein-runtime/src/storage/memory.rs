//! In-process storage backend.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use skein_core::store::{StepLock, WorkflowStore};
use skein_core::workflow::{
    ActivityKey, ActivityKind, ActivityStatus, ActivityStep, QueueToken, WorkflowQueueItem,
    WorkflowStep,
};
use skein_core::{Result, SkeinError};

#[derive(Default)]
struct Inner {
    workflows: HashMap<String, WorkflowStep>,
    /// History per workflow, in sequence order.
    activities: HashMap<String, Vec<ActivityStep>>,
    queue: HashMap<QueueToken, WorkflowQueueItem>,
    locks: HashMap<(String, i64), HeldLock>,
}

struct HeldLock {
    holder: Uuid,
    expires: Instant,
}

/// Storage backed by process memory.
///
/// State is lost on restart; use it for tests and single-process embedding.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of wake-ups currently queued across all workflows.
    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}

fn same_key(step: &ActivityStep, key: &ActivityKey) -> bool {
    step.kind == key.kind && step.key_hash == key.key_hash && step.key == key.key
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn insert_workflow(&self, workflow: &WorkflowStep) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.workflows.contains_key(&workflow.id) {
            return Err(SkeinError::Conflict(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        inner.workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowStep>> {
        Ok(self.inner.lock().await.workflows.get(workflow_id).cloned())
    }

    async fn update_workflow(&self, workflow: &WorkflowStep) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.workflows.get_mut(&workflow.id) {
            Some(existing) if existing.status.is_terminal() => Ok(false),
            Some(existing) => {
                *existing = workflow.clone();
                Ok(true)
            }
            None => Err(SkeinError::NotFound(format!(
                "workflow {} not found",
                workflow.id
            ))),
        }
    }

    async fn insert_activity(&self, step: &ActivityStep) -> Result<ActivityStep> {
        let mut inner = self.inner.lock().await;
        let history = inner.activities.entry(step.workflow_id.clone()).or_default();

        if history.iter().any(|s| same_key(s, &step.activity_key())) {
            return Err(SkeinError::Conflict(format!(
                "call site {} already recorded for workflow {}",
                step.key, step.workflow_id
            )));
        }

        let mut stored = step.clone();
        stored.sequence_id = history.last().map_or(1, |last| last.sequence_id + 1);
        history.push(stored.clone());
        Ok(stored)
    }

    async fn get_activity(
        &self,
        workflow_id: &str,
        key: &ActivityKey,
    ) -> Result<Option<ActivityStep>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .activities
            .get(workflow_id)
            .and_then(|history| history.iter().find(|s| same_key(s, key)))
            .cloned())
    }

    async fn update_activity(&self, step: &ActivityStep) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let existing = inner
            .activities
            .get_mut(&step.workflow_id)
            .and_then(|history| {
                history
                    .iter_mut()
                    .find(|s| s.sequence_id == step.sequence_id)
            })
            .ok_or_else(|| {
                SkeinError::NotFound(format!(
                    "step {} of workflow {} not found",
                    step.sequence_id, step.workflow_id
                ))
            })?;
        *existing = step.clone();
        Ok(())
    }

    async fn list_activities(&self, workflow_id: &str) -> Result<Vec<ActivityStep>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .activities
            .get(workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_event(
        &self,
        workflow_id: &str,
        event_name: &str,
    ) -> Result<Option<ActivityStep>> {
        let inner = self.inner.lock().await;
        Ok(inner.activities.get(workflow_id).and_then(|history| {
            history
                .iter()
                .filter(|s| s.kind == ActivityKind::Event && s.status == ActivityStatus::Running)
                .find(|s| {
                    s.parameters
                        .as_array()
                        .is_some_and(|names| names.iter().any(|n| n.as_str() == Some(event_name)))
                })
                .cloned()
        }))
    }

    async fn enqueue_wakeup(
        &self,
        workflow_id: &str,
        due: DateTime<Utc>,
        existing: Option<&QueueToken>,
    ) -> Result<QueueToken> {
        let mut inner = self.inner.lock().await;
        if let Some(token) = existing {
            inner.queue.remove(token);
        }
        let item = WorkflowQueueItem::new(workflow_id, due);
        let token = item.token;
        inner.queue.insert(token, item);
        Ok(token)
    }

    async fn remove_wakeups(&self, tokens: &[QueueToken]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for token in tokens {
            inner.queue.remove(token);
        }
        Ok(())
    }

    async fn due_wakeups(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<WorkflowQueueItem>> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| SkeinError::Config(format!("invalid lease: {}", e)))?;
        let mut inner = self.inner.lock().await;

        let mut due: Vec<&mut WorkflowQueueItem> = inner
            .queue
            .values_mut()
            .filter(|item| item.is_available(now))
            .collect();
        due.sort_by_key(|item| item.due_at);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|item| {
                item.leased_until = Some(now + lease);
                item.clone()
            })
            .collect())
    }

    async fn pending_wakeups(&self, workflow_id: &str) -> Result<Vec<WorkflowQueueItem>> {
        let inner = self.inner.lock().await;
        let mut items: Vec<WorkflowQueueItem> = inner
            .queue
            .values()
            .filter(|item| item.workflow_id == workflow_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.due_at);
        Ok(items)
    }

    async fn acquire_lock(
        &self,
        workflow_id: &str,
        sequence_id: i64,
        ttl: Duration,
    ) -> Result<Option<StepLock>> {
        let mut inner = self.inner.lock().await;
        let key = (workflow_id.to_string(), sequence_id);
        let now = Instant::now();

        if inner.locks.get(&key).is_some_and(|held| held.expires > now) {
            return Ok(None);
        }

        let holder = Uuid::new_v4();
        inner.locks.insert(
            key,
            HeldLock {
                holder,
                expires: now + ttl,
            },
        );

        Ok(Some(StepLock {
            workflow_id: workflow_id.to_string(),
            sequence_id,
            holder,
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
        }))
    }

    async fn release_lock(&self, lock: &StepLock) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let key = (lock.workflow_id.clone(), lock.sequence_id);
        if inner
            .locks
            .get(&key)
            .is_some_and(|held| held.holder == lock.holder)
        {
            inner.locks.remove(&key);
        }
        Ok(())
    }
}
