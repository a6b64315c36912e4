use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use skein_core::clock::Clock;
use skein_core::config::EngineConfig;
use skein_core::store::{self, WorkflowStore};
use skein_core::workflow::{
    ActivityStep, EventResult, ResolvedStep, Services, Workflow, WorkflowContext,
    WorkflowQueueItem, WorkflowSnapshot, WorkflowStatus, WorkflowStep,
};
use skein_core::{Result, SkeinError};

use super::registry::{WorkflowEntry, WorkflowRegistry};

/// What one dispatch did to its workflow.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The workflow was missing or already finished.
    Skipped,
    /// The workflow returned.
    Completed(serde_json::Value),
    /// The workflow is parked until `wake_at`.
    Suspended { wake_at: DateTime<Utc> },
    /// The workflow returned an error.
    Failed { error: String },
}

/// Result of re-running a workflow against its recorded history.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayReport {
    pub outcome: DispatchOutcome,
    /// Call sites in the order the replay resolved them.
    pub steps: Vec<ResolvedStep>,
}

/// The scheduling core.
///
/// Owns the store, clock, registry, services and configuration and is the
/// only component that mutates workflow records.
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    clock: Arc<dyn Clock>,
    registry: Arc<WorkflowRegistry>,
    services: Arc<Services>,
    config: EngineConfig,
}

impl WorkflowEngine {
    /// Create an engine, rejecting configurations it cannot run.
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        clock: Arc<dyn Clock>,
        registry: WorkflowRegistry,
        services: Services,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        registry.check_services(&services)?;

        Ok(Self {
            store,
            clock,
            registry: Arc::new(registry),
            services: Arc::new(services),
            config,
        })
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a workflow and make it due immediately.
    ///
    /// A generated ID is used when `id` is `None`.
    pub async fn create_workflow(
        &self,
        workflow_type: &str,
        input: serde_json::Value,
        id: Option<String>,
    ) -> Result<String> {
        if !self.registry.contains(workflow_type) {
            return Err(SkeinError::NotFound(format!(
                "Workflow '{}' not found",
                workflow_type
            )));
        }

        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if id.trim().is_empty() {
            return Err(SkeinError::Validation("workflow id must not be empty".into()));
        }

        let now = self.clock.now();
        let workflow = WorkflowStep::new(&id, workflow_type, input, now);
        store::schedule_workflow(self.store.as_ref(), workflow, now).await?;

        tracing::info!(workflow_id = %id, workflow_type, "Workflow created");
        Ok(id)
    }

    /// Start workflow `W` with a generated ID.
    pub async fn start<W: Workflow>(&self, input: W::Input) -> Result<String> {
        let input = serde_json::to_value(input)?;
        self.create_workflow(W::info().name, input, None).await
    }

    /// Start workflow `W` with a caller-chosen ID. Fails with `Conflict` if
    /// the ID is taken.
    pub async fn start_with_id<W: Workflow>(
        &self,
        id: impl Into<String>,
        input: W::Input,
    ) -> Result<String> {
        let input = serde_json::to_value(input)?;
        self.create_workflow(W::info().name, input, Some(id.into()))
            .await
    }

    /// Dispatch every due wake-up once.
    ///
    /// Returns the number of wake-ups taken from the queue. Dispatches that
    /// hit infrastructure errors are logged and left for redelivery.
    pub async fn process_due(&self) -> Result<usize> {
        let now = self.clock.now();
        let items = self
            .store
            .due_wakeups(now, self.config.batch_size, self.config.lease())
            .await?;

        if items.is_empty() {
            return Ok(0);
        }

        tracing::debug!(count = items.len(), "Dispatching due workflows");
        let results = join_all(items.iter().map(|item| self.dispatch(item))).await;

        for (item, result) in items.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(
                    workflow_id = %item.workflow_id,
                    token = %item.token,
                    error = %e,
                    "Dispatch aborted; wake-up will be redelivered after its lease"
                );
            }
        }

        Ok(items.len())
    }

    /// Run one workflow from the top for a wake-up.
    pub async fn dispatch(&self, item: &WorkflowQueueItem) -> Result<DispatchOutcome> {
        let mut workflow = match self.store.get_workflow(&item.workflow_id).await? {
            Some(workflow) if !workflow.status.is_terminal() => workflow,
            _ => {
                tracing::debug!(
                    workflow_id = %item.workflow_id,
                    token = %item.token,
                    "Discarding stale wake-up"
                );
                self.store.remove_wakeups(&[item.token]).await?;
                return Ok(DispatchOutcome::Skipped);
            }
        };

        let Some(entry) = self.registry.get(&workflow.workflow_type) else {
            let error = format!("Workflow '{}' not found", workflow.workflow_type);
            tracing::error!(workflow_id = %workflow.id, "{}", error);
            workflow.fail(error.clone(), self.clock.now());
            self.store.update_workflow(&workflow).await?;
            self.store.remove_wakeups(&[item.token]).await?;
            return Ok(DispatchOutcome::Failed { error });
        };

        let ctx = self.context(&workflow, entry);
        let result = (entry.handler)(&ctx, workflow.input.clone()).await;
        let queue = ctx.queue_outcome();

        match result {
            Ok(output) => {
                workflow.complete(output.clone(), self.clock.now());
                let written = self.store.update_workflow(&workflow).await?;

                let mut done = queue.accrued;
                done.push(item.token);
                self.store.remove_wakeups(&done).await?;
                if !written {
                    return Ok(self.finished_elsewhere(item));
                }

                tracing::info!(
                    workflow_id = %workflow.id,
                    workflow_type = %workflow.workflow_type,
                    "Workflow completed"
                );
                Ok(DispatchOutcome::Completed(output))
            }
            Err(SkeinError::Suspended { wake_at }) => {
                workflow.suspend(queue.pending);
                if !self.store.update_workflow(&workflow).await? {
                    let mut done = queue.accrued;
                    done.push(item.token);
                    self.store.remove_wakeups(&done).await?;
                    return Ok(self.finished_elsewhere(item));
                }

                let mut stale = queue.stale();
                if queue.pending != Some(item.token) {
                    stale.push(item.token);
                }
                self.store.remove_wakeups(&stale).await?;

                tracing::debug!(
                    workflow_id = %workflow.id,
                    wake_at = %wake_at,
                    "Workflow suspended"
                );
                Ok(DispatchOutcome::Suspended { wake_at })
            }
            Err(e) if e.is_transient() && ctx.interrupted() => Err(e),
            Err(e) => {
                let error = e.to_string();
                workflow.fail(error.clone(), self.clock.now());
                let written = self.store.update_workflow(&workflow).await?;

                let mut done = queue.accrued;
                done.push(item.token);
                self.store.remove_wakeups(&done).await?;
                if !written {
                    return Ok(self.finished_elsewhere(item));
                }

                tracing::warn!(
                    workflow_id = %workflow.id,
                    workflow_type = %workflow.workflow_type,
                    error = %error,
                    "Workflow failed"
                );
                Ok(DispatchOutcome::Failed { error })
            }
        }
    }

    /// A concurrent dispatch reached a terminal status first.
    fn finished_elsewhere(&self, item: &WorkflowQueueItem) -> DispatchOutcome {
        tracing::debug!(
            workflow_id = %item.workflow_id,
            token = %item.token,
            "Workflow finished by another dispatch, dropping this result"
        );
        DispatchOutcome::Skipped
    }

    /// Deliver an event to the workflow's outstanding wait for `name`.
    ///
    /// Returns `false` when nothing is waiting, or `NotFound` if
    /// `require_waiter` is set.
    pub async fn raise_event<T: Serialize>(
        &self,
        workflow_id: &str,
        name: &str,
        value: T,
        require_waiter: bool,
    ) -> Result<bool> {
        let value = serde_json::to_value(value)?;
        let no_waiter = || {
            if require_waiter {
                Err(SkeinError::NotFound(format!(
                    "workflow {} is not waiting for event '{}'",
                    workflow_id, name
                )))
            } else {
                Ok(false)
            }
        };

        let Some(step) = self.store.get_event(workflow_id, name).await? else {
            return no_waiter();
        };

        let lock =
            store::lock_step(self.store.as_ref(), workflow_id, step.sequence_id, &self.config)
                .await?;
        let delivered = self.deliver_event(step, name, value).await;
        if let Err(e) = self.store.release_lock(&lock).await {
            tracing::warn!(workflow_id, error = %e, "Failed to release step lock");
        }

        match delivered? {
            true => Ok(true),
            false => no_waiter(),
        }
    }

    async fn deliver_event(
        &self,
        step: ActivityStep,
        name: &str,
        value: serde_json::Value,
    ) -> Result<bool> {
        let Some(mut step) = self
            .store
            .get_activity(&step.workflow_id, &step.activity_key())
            .await?
        else {
            return Ok(false);
        };
        if step.status.is_terminal() {
            return Ok(false);
        }

        let now = self.clock.now();
        let timeout_token = step.queue_token;
        let token = self.store.enqueue_wakeup(&step.workflow_id, now, None).await?;

        step.complete(serde_json::to_value(EventResult::new(name, value))?, now);
        step.eta = now;
        step.queue_token = Some(token);
        self.store.update_activity(&step).await?;

        if let Some(mut workflow) = self.store.get_workflow(&step.workflow_id).await? {
            workflow.resume(token);
            self.store.update_workflow(&workflow).await?;
        }

        if let Some(timeout_token) = timeout_token {
            self.store.remove_wakeups(&[timeout_token]).await?;
        }

        tracing::info!(
            workflow_id = %step.workflow_id,
            sequence_id = step.sequence_id,
            event = name,
            "Event delivered"
        );
        Ok(true)
    }

    /// Current status of a workflow.
    pub async fn status(&self, workflow_id: &str) -> Result<WorkflowSnapshot> {
        Ok(self.load(workflow_id).await?.snapshot())
    }

    /// Typed result of a workflow.
    ///
    /// `None` while it is still running or suspended.
    pub async fn result<T: DeserializeOwned>(&self, workflow_id: &str) -> Result<Option<T>> {
        let workflow = self.load(workflow_id).await?;
        match workflow.status {
            WorkflowStatus::Completed => {
                let value = workflow.result.unwrap_or(serde_json::Value::Null);
                serde_json::from_value(value)
                    .map(Some)
                    .map_err(|e| SkeinError::Deserialization(e.to_string()))
            }
            WorkflowStatus::Failed => Err(SkeinError::WorkflowFailed(
                workflow.error.unwrap_or_default(),
            )),
            WorkflowStatus::Running | WorkflowStatus::Suspended => Ok(None),
        }
    }

    /// Recorded call sites of a workflow, ordered by sequence number.
    pub async fn history(&self, workflow_id: &str) -> Result<Vec<ActivityStep>> {
        self.store.list_activities(workflow_id).await
    }

    /// Wake-ups still queued for a workflow.
    pub async fn pending_wakeups(&self, workflow_id: &str) -> Result<Vec<WorkflowQueueItem>> {
        self.store.pending_wakeups(workflow_id).await
    }

    /// Re-run a workflow against its history without scheduling, executing or
    /// persisting anything.
    ///
    /// Fails with `InvalidState` if the code reaches a call site the history
    /// does not know, which means the workflow is not deterministic.
    pub async fn replay(&self, workflow_id: &str) -> Result<ReplayReport> {
        let workflow = self.load(workflow_id).await?;
        let entry = self.registry.get(&workflow.workflow_type).ok_or_else(|| {
            SkeinError::NotFound(format!("Workflow '{}' not found", workflow.workflow_type))
        })?;

        let ctx = self.context(&workflow, entry).replaying();
        let outcome = match (entry.handler)(&ctx, workflow.input.clone()).await {
            Ok(output) => DispatchOutcome::Completed(output),
            Err(SkeinError::Suspended { wake_at }) => DispatchOutcome::Suspended { wake_at },
            Err(e @ SkeinError::InvalidState(_)) => return Err(e),
            Err(e) if e.is_transient() && ctx.interrupted() => return Err(e),
            Err(e) => DispatchOutcome::Failed {
                error: e.to_string(),
            },
        };

        Ok(ReplayReport {
            outcome,
            steps: ctx.resolved_steps(),
        })
    }

    fn context(&self, workflow: &WorkflowStep, entry: &WorkflowEntry) -> WorkflowContext {
        WorkflowContext::new(
            workflow,
            self.store.clone(),
            self.clock.clone(),
            self.config.clone(),
            entry.activities.clone(),
            self.services.clone(),
        )
    }

    async fn load(&self, workflow_id: &str) -> Result<WorkflowStep> {
        self.store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| SkeinError::NotFound(format!("workflow {} not found", workflow_id)))
    }
}
