use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::activity::{Activity, ActivityContext, ActivityTable, Services};
use super::key::{self, KeyMode};
use super::queue::QueueToken;
use super::state::WorkflowStep;
use super::step::{ActivityKey, ActivityKind, ActivityStatus, ActivityStep};
use super::step_runner::ActivityCall;
use super::suspend::{EventResult, Resolution};
use super::traits::Workflow;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::store::{self, WorkflowStore};
use crate::{Result, SkeinError};

/// How a context treats call sites it has no finished history for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Schedule, run and wait as needed.
    Live,
    /// Read history only. Unknown call sites are a determinism violation.
    Replay,
}

/// A call site resolved during one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStep {
    pub sequence_id: i64,
    pub kind: ActivityKind,
    pub name: String,
    /// Logical time right after the call site resolved.
    pub logical_time: DateTime<Utc>,
}

/// Wake-ups touched by one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOutcome {
    /// Tokens of every step scheduled or resolved during the execution.
    pub accrued: Vec<QueueToken>,
    /// Token of the wake-up the workflow suspended on.
    pub pending: Option<QueueToken>,
}

impl QueueOutcome {
    /// Tokens that are safe to delete when the workflow suspends.
    pub fn stale(&self) -> Vec<QueueToken> {
        self.accrued
            .iter()
            .copied()
            .filter(|token| Some(*token) != self.pending)
            .collect()
    }
}

struct ExecutionState {
    current_time: DateTime<Utc>,
    outcome: QueueOutcome,
    resolved: Vec<ResolvedStep>,
    /// Set once a call site hit a storage or locking failure.
    interrupted: bool,
}

struct CallSite {
    key: ActivityKey,
    name: String,
    parameters: Value,
    eta: DateTime<Utc>,
}

/// Context available to workflow code.
///
/// Every side effect of a workflow goes through this context so that it is
/// recorded once and replayed from history afterwards. The context owns the
/// workflow's logical clock: it starts at the workflow record's
/// `last_updated` and only moves forward when a call site resolves.
pub struct WorkflowContext {
    workflow_id: String,
    workflow_type: String,
    input: Value,
    started_at: DateTime<Utc>,
    mode: ExecutionMode,
    store: Arc<dyn WorkflowStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    activities: Arc<ActivityTable>,
    services: Arc<Services>,
    state: Mutex<ExecutionState>,
}

impl WorkflowContext {
    /// Create a context for one execution of `workflow`.
    pub fn new(
        workflow: &WorkflowStep,
        store: Arc<dyn WorkflowStore>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        activities: Arc<ActivityTable>,
        services: Arc<Services>,
    ) -> Self {
        Self {
            workflow_id: workflow.id.clone(),
            workflow_type: workflow.workflow_type.clone(),
            input: workflow.input.clone(),
            started_at: workflow.created_at,
            mode: ExecutionMode::Live,
            store,
            clock,
            config,
            activities,
            services,
            state: Mutex::new(ExecutionState {
                current_time: workflow.clock_seed(),
                outcome: QueueOutcome::default(),
                resolved: Vec::new(),
                interrupted: false,
            }),
        }
    }

    /// Switch to history-only execution.
    pub fn replaying(mut self) -> Self {
        self.mode = ExecutionMode::Replay;
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    /// Serialized workflow input.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// When the workflow was created.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn is_replaying(&self) -> bool {
        self.mode == ExecutionMode::Replay
    }

    /// Deterministic workflow time. Use this instead of the wall clock.
    pub fn current_time(&self) -> DateTime<Utc> {
        self.state().current_time
    }

    /// Wake-ups scheduled, resolved or pending during this execution.
    pub fn queue_outcome(&self) -> QueueOutcome {
        self.state().outcome.clone()
    }

    /// Call sites resolved so far, in order.
    pub fn resolved_steps(&self) -> Vec<ResolvedStep> {
        self.state().resolved.clone()
    }

    /// Whether a call site failed on infrastructure during this execution.
    ///
    /// Only then is a transient error from workflow code worth redelivering.
    pub fn interrupted(&self) -> bool {
        self.state().interrupted
    }

    /// Build a call to activity `A`.
    pub fn activity<A: Activity>(&self, args: A::Args) -> ActivityCall<'_, A> {
        ActivityCall::new(self, args)
    }

    /// Call activity `A` now.
    pub async fn call<A: Activity>(&self, args: A::Args) -> Result<A::Output> {
        self.activity::<A>(args).run().await
    }

    /// Durable timer relative to the logical clock.
    ///
    /// ```ignore
    /// ctx.delay(Duration::from_secs(30 * 24 * 60 * 60)).await?;
    /// ```
    pub async fn delay(&self, duration: Duration) -> Result<()> {
        let until = self.current_time() + to_chrono(duration)?;
        self.delay_until(until).await
    }

    /// Durable timer until an absolute time.
    pub async fn delay_until(&self, until: DateTime<Utc>) -> Result<()> {
        let site = CallSite {
            key: key::delay_key(until),
            name: "delay".to_string(),
            parameters: serde_json::json!({ "until": until }),
            eta: until,
        };
        self.resolve(site).await.map(|_| ())
    }

    /// Wait up to `max_wait` for any of the named events.
    ///
    /// Returns `None` when the wait timed out.
    ///
    /// ```ignore
    /// match ctx.wait_for_events(Duration::from_secs(15 * 60), &["Verify", "Resend"]).await? {
    ///     Some(event) if event.name == "Verify" => { /* ... */ }
    ///     Some(_) => { /* resend */ }
    ///     None => { /* expired */ }
    /// }
    /// ```
    pub async fn wait_for_events(
        &self,
        max_wait: Duration,
        names: &[&str],
    ) -> Result<Option<EventResult>> {
        let mut names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        names.sort_unstable();
        names.dedup();
        if names.is_empty() || names.iter().any(|n| n.trim().is_empty()) {
            return Err(SkeinError::Validation(
                "wait_for_events needs at least one non-empty event name".into(),
            ));
        }

        let eta = self.current_time() + to_chrono(max_wait)?;
        let site = CallSite {
            key: key::event_key(&names, eta),
            name: names.join(","),
            parameters: serde_json::json!(names),
            eta,
        };

        match self.resolve(site).await? {
            Value::Null => Ok(None),
            value => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| SkeinError::Deserialization(e.to_string())),
        }
    }

    /// Wait up to `max_wait` for one named event and decode its value.
    pub async fn wait_for_event<T: DeserializeOwned>(
        &self,
        max_wait: Duration,
        name: &str,
    ) -> Result<Option<T>> {
        match self.wait_for_events(max_wait, &[name]).await? {
            Some(event) => event.value_as().map(Some),
            None => Ok(None),
        }
    }

    /// Start a child workflow exactly once and return its ID.
    ///
    /// The child runs independently; the parent does not wait for it.
    pub async fn start_child<W: Workflow>(&self, input: W::Input) -> Result<String> {
        let workflow_type = W::info().name;
        let parameters = serde_json::to_value(&input)?;
        let site = CallSite {
            key: key::child_key(workflow_type, &parameters),
            name: workflow_type.to_string(),
            parameters,
            eta: self.current_time(),
        };

        match self.resolve(site).await? {
            Value::String(id) => Ok(id),
            other => Err(SkeinError::Deserialization(format!(
                "expected child workflow id, got {}",
                other
            ))),
        }
    }

    pub(crate) async fn execute_activity<A: Activity>(
        &self,
        args: A::Args,
        eta: DateTime<Utc>,
        mode: KeyMode,
    ) -> Result<A::Output> {
        let name = A::info().name;
        if !self.activities.contains(name) {
            return Err(SkeinError::Validation(format!(
                "activity '{}' is not declared by workflow '{}'",
                name, self.workflow_type
            )));
        }

        let parameters = serde_json::to_value(&args)?;
        let site = CallSite {
            key: key::activity_key(name, &parameters, &mode, self.current_time()),
            name: name.to_string(),
            parameters,
            eta,
        };

        let value = self.resolve(site).await?;
        serde_json::from_value(value).map_err(|e| SkeinError::Deserialization(e.to_string()))
    }

    async fn resolve(&self, site: CallSite) -> Result<Value> {
        let polled = self.poll(site).await;
        if matches!(&polled, Err(e) if e.is_transient()) {
            self.state().interrupted = true;
        }
        polled?.into_result()
    }

    /// Drive one call site until it has a result or is parked on a future
    /// wake-up.
    async fn poll(&self, site: CallSite) -> Result<Resolution<Value>> {
        let mut step = self.find_or_schedule(&site).await?;

        loop {
            self.accrue(step.queue_token);

            match step.status {
                ActivityStatus::Completed => {
                    self.advance(&step);
                    return Ok(Resolution::Ready(step.result.unwrap_or(Value::Null)));
                }
                ActivityStatus::Failed => {
                    self.advance(&step);
                    return Err(SkeinError::ActivityFailed {
                        activity: step.name,
                        message: step.error.unwrap_or_default(),
                    });
                }
                ActivityStatus::Running => {}
            }

            if self.is_replaying() {
                return Ok(Resolution::Pending { wake_at: step.eta });
            }

            // Negative means overdue.
            let remaining = (step.eta - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if remaining > self.config.suspend_threshold() {
                self.park(step.queue_token);
                tracing::debug!(
                    workflow_id = %self.workflow_id,
                    sequence_id = step.sequence_id,
                    kind = step.kind.as_str(),
                    wake_at = %step.eta,
                    "Call site not due, suspending"
                );
                return Ok(Resolution::Pending { wake_at: step.eta });
            }

            let key = step.activity_key();
            step = match step.kind {
                ActivityKind::Activity => {
                    if !remaining.is_zero() {
                        tokio::time::sleep(remaining).await;
                    }
                    self.locked(step.sequence_id, self.run_activity(&key))
                        .await?
                }
                ActivityKind::Workflow => {
                    self.locked(step.sequence_id, self.spawn_child(&key))
                        .await?
                }
                ActivityKind::Delay => {
                    if !remaining.is_zero() {
                        tokio::time::sleep(remaining).await;
                    }
                    self.locked(step.sequence_id, self.finish_wait(&key))
                        .await?
                }
                ActivityKind::Event => self.await_event(step, remaining).await?,
            };
        }
    }

    async fn find_or_schedule(&self, site: &CallSite) -> Result<ActivityStep> {
        let mut conflicts = 0;
        loop {
            if let Some(step) = self.store.get_activity(&self.workflow_id, &site.key).await? {
                return Ok(step);
            }

            if self.is_replaying() {
                return Err(SkeinError::InvalidState(format!(
                    "non-deterministic workflow {}: call site '{}' has no history",
                    self.workflow_id, site.key.key
                )));
            }

            match self.schedule(site).await {
                Ok(step) => return Ok(step),
                Err(SkeinError::Conflict(_)) if conflicts < self.config.conflict_retries => {
                    conflicts += 1;
                    tracing::debug!(
                        workflow_id = %self.workflow_id,
                        key = %site.key.key,
                        "Call site inserted concurrently, re-reading"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn schedule(&self, site: &CallSite) -> Result<ActivityStep> {
        let token = self
            .store
            .enqueue_wakeup(&self.workflow_id, site.eta, None)
            .await?;

        let mut step = ActivityStep::new(
            &self.workflow_id,
            &site.key,
            &site.name,
            site.parameters.clone(),
            site.eta,
            self.clock.now(),
        );
        step.queue_token = Some(token);

        match self.store.insert_activity(&step).await {
            Ok(step) => {
                tracing::debug!(
                    workflow_id = %self.workflow_id,
                    sequence_id = step.sequence_id,
                    kind = step.kind.as_str(),
                    name = %step.name,
                    eta = %step.eta,
                    "Scheduled call site"
                );
                Ok(step)
            }
            Err(e) => {
                self.store.remove_wakeups(&[token]).await?;
                Err(e)
            }
        }
    }

    /// Run `work` while holding the lock of step `sequence_id`.
    async fn locked<T>(
        &self,
        sequence_id: i64,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let lock =
            store::lock_step(self.store.as_ref(), &self.workflow_id, sequence_id, &self.config)
                .await?;

        let outcome = work.await;

        if let Err(e) = self.store.release_lock(&lock).await {
            tracing::warn!(
                workflow_id = %self.workflow_id,
                sequence_id,
                error = %e,
                "Failed to release step lock"
            );
        }
        outcome
    }

    async fn reload(&self, key: &ActivityKey) -> Result<ActivityStep> {
        self.store
            .get_activity(&self.workflow_id, key)
            .await?
            .ok_or_else(|| {
                SkeinError::Internal(format!(
                    "history entry '{}' of workflow {} disappeared",
                    key.key, self.workflow_id
                ))
            })
    }

    /// Execute an activity body from its stored parameters.
    async fn run_activity(&self, key: &ActivityKey) -> Result<ActivityStep> {
        let mut step = self.reload(key).await?;
        if step.status.is_terminal() {
            return Ok(step);
        }

        let handler = self
            .activities
            .get(&step.name)
            .map(|activity| activity.handler.clone())
            .ok_or_else(|| {
                SkeinError::Validation(format!(
                    "activity '{}' is not declared by workflow '{}'",
                    step.name, self.workflow_type
                ))
            })?;

        let activity_ctx = ActivityContext::new(
            &self.workflow_id,
            step.sequence_id,
            step.eta,
            self.clock.clone(),
            self.services.clone(),
        );

        tracing::debug!(
            workflow_id = %self.workflow_id,
            sequence_id = step.sequence_id,
            activity = %step.name,
            "Running activity"
        );

        match handler(activity_ctx, step.parameters.clone()).await {
            Ok(result) => step.complete(result, self.clock.now()),
            Err(e) => {
                tracing::warn!(
                    workflow_id = %self.workflow_id,
                    sequence_id = step.sequence_id,
                    activity = %step.name,
                    error = %e,
                    "Activity failed"
                );
                step.fail(e.to_string(), self.clock.now());
            }
        }

        self.store.update_activity(&step).await?;
        Ok(step)
    }

    /// Create the child workflow of a Workflow-kind step.
    async fn spawn_child(&self, key: &ActivityKey) -> Result<ActivityStep> {
        let mut step = self.reload(key).await?;
        if step.status.is_terminal() {
            return Ok(step);
        }

        let child_id = child_workflow_id(&self.workflow_id, &step.key_hash);
        let now = self.clock.now();
        let child = WorkflowStep::new(&child_id, &step.name, step.parameters.clone(), now);

        match store::schedule_workflow(self.store.as_ref(), child, now).await {
            Ok(_) => {
                tracing::info!(
                    workflow_id = %self.workflow_id,
                    child_id = %child_id,
                    workflow_type = %step.name,
                    "Started child workflow"
                );
            }
            Err(SkeinError::Conflict(_)) => {
                if let Some(mut existing) = self.store.get_workflow(&child_id).await? {
                    store::ensure_wakeup(self.store.as_ref(), &mut existing, now).await?;
                }
            }
            Err(e) => return Err(e),
        }

        step.complete(Value::String(child_id), now);
        self.store.update_activity(&step).await?;
        Ok(step)
    }

    /// Poll an event wait until it is resolved or its deadline passes.
    async fn await_event(&self, step: ActivityStep, remaining: Duration) -> Result<ActivityStep> {
        let key = step.activity_key();
        let deadline = tokio::time::Instant::now() + remaining;

        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.config.event_poll_interval().min(deadline - now)).await;

            let current = self.reload(&key).await?;
            if current.status.is_terminal() {
                return Ok(current);
            }
        }

        self.locked(step.sequence_id, self.finish_wait(&key)).await
    }

    /// Complete a timer or an expired event wait with the empty result.
    async fn finish_wait(&self, key: &ActivityKey) -> Result<ActivityStep> {
        let mut step = self.reload(key).await?;
        if step.status.is_terminal() {
            return Ok(step);
        }

        let at = self.clock.now().max(step.eta);
        step.complete(Value::Null, at);
        self.store.update_activity(&step).await?;
        Ok(step)
    }

    fn state(&self) -> MutexGuard<'_, ExecutionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accrue(&self, token: Option<QueueToken>) {
        if let Some(token) = token {
            let mut state = self.state();
            if !state.outcome.accrued.contains(&token) {
                state.outcome.accrued.push(token);
            }
        }
    }

    fn park(&self, token: Option<QueueToken>) {
        self.state().outcome.pending = token;
    }

    fn advance(&self, step: &ActivityStep) {
        let mut state = self.state();
        if step.last_updated > state.current_time {
            state.current_time = step.last_updated;
        }
        let logical_time = state.current_time;
        state.resolved.push(ResolvedStep {
            sequence_id: step.sequence_id,
            kind: step.kind,
            name: step.name.clone(),
            logical_time,
        });
    }
}

/// ID of the child started by the call site with `key_hash`.
pub fn child_workflow_id(parent_id: &str, key_hash: &str) -> String {
    let short = key_hash.get(..16).unwrap_or(key_hash);
    format!("{}/{}", parent_id, short)
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| SkeinError::Validation(format!("invalid duration: {}", e)))
}
