use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use skein_core::workflow::{
    ActivitySet, ActivityTable, Services, Workflow, WorkflowContext, WorkflowInfo,
};
use skein_core::{Result, SkeinError};

/// Type-erased workflow entry point: serialized input in, serialized output out.
pub type BoxedWorkflowHandler = Arc<
    dyn for<'a> Fn(
            &'a WorkflowContext,
            serde_json::Value,
        ) -> BoxFuture<'a, Result<serde_json::Value>>
        + Send
        + Sync,
>;

/// A registered workflow type.
#[derive(Clone)]
pub struct WorkflowEntry {
    pub info: WorkflowInfo,
    /// Activities the workflow may call.
    pub activities: Arc<ActivityTable>,
    pub handler: BoxedWorkflowHandler,
}

fn run_workflow<'a, W: Workflow>(
    ctx: &'a WorkflowContext,
    input: serde_json::Value,
) -> BoxFuture<'a, Result<serde_json::Value>> {
    Box::pin(async move {
        let input: W::Input = serde_json::from_value(input)
            .map_err(|e| SkeinError::Validation(format!("invalid workflow input: {}", e)))?;
        let workflow = W::default();
        let output = workflow.execute(ctx, input).await?;
        serde_json::to_value(output).map_err(SkeinError::from)
    })
}

impl WorkflowEntry {
    /// Build the entry for `W`, validating its activity declarations.
    pub fn new<W: Workflow>() -> Result<Self> {
        let info = W::info();
        if info.name.trim().is_empty() {
            return Err(SkeinError::Config(format!(
                "workflow {} has an empty name",
                std::any::type_name::<W>()
            )));
        }

        let mut activities = ActivitySet::new();
        W::activities(&mut activities);
        let activities = activities.build().map_err(|e| {
            SkeinError::Config(format!("workflow '{}': {}", info.name, e))
        })?;

        Ok(Self {
            info,
            activities: Arc::new(activities),
            handler: Arc::new(run_workflow::<W>),
        })
    }
}

/// Registry of workflow types known to an engine.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, WorkflowEntry>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow type.
    pub fn register<W: Workflow>(&mut self) -> Result<&mut Self> {
        let entry = WorkflowEntry::new::<W>()?;
        let name = entry.info.name;
        if self.workflows.contains_key(name) {
            return Err(SkeinError::Config(format!(
                "workflow '{}' is registered twice",
                name
            )));
        }

        tracing::debug!(
            workflow_type = name,
            version = entry.info.version,
            activities = entry.activities.len(),
            "Registered workflow"
        );
        self.workflows.insert(name.to_string(), entry);
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowEntry> {
        self.workflows.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Registered workflow type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Check that every injected service of every activity is available.
    pub fn check_services(&self, services: &Services) -> Result<()> {
        for entry in self.workflows.values() {
            entry.activities.check_services(services).map_err(|e| {
                SkeinError::Config(format!("workflow '{}': {}", entry.info.name, e))
            })?;
        }
        Ok(())
    }
}
