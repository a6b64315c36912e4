//! Activities: memoized side effects called from workflows.
//!
//! An activity has one serialized data argument (`Args`) that is stored in
//! history and hashed into the call-site key, plus any number of injected
//! services that are resolved from [`Services`] at execution time and never
//! persisted.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};

use crate::clock::Clock;
use crate::{Result, SkeinError};

/// Trait for activity definitions.
pub trait Activity: Send + Sync + 'static {
    /// Data argument, persisted with the call site.
    type Args: DeserializeOwned + Serialize + Send + Sync;
    /// Result, persisted once the activity completes.
    type Output: DeserializeOwned + Serialize + Send;

    /// Get activity metadata.
    fn info() -> ActivityInfo;

    /// Execute the activity body.
    fn run(
        ctx: ActivityContext,
        args: Self::Args,
    ) -> impl Future<Output = Result<Self::Output>> + Send;
}

/// Activity metadata.
#[derive(Debug, Clone)]
pub struct ActivityInfo {
    /// Name used in call-site keys. Must be unique within a workflow type.
    pub name: &'static str,
    /// Services the body resolves from the container.
    pub services: Vec<ServiceRequirement>,
}

impl ActivityInfo {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            services: Vec::new(),
        }
    }

    /// Declare an injected service.
    pub fn inject<T: Send + Sync + 'static>(mut self) -> Self {
        self.services.push(ServiceRequirement::of::<T>());
        self
    }
}

/// An injected service declared by an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRequirement {
    pub type_id: TypeId,
    pub type_name: &'static str,
}

impl ServiceRequirement {
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }
}

/// Host service container.
#[derive(Clone, Default)]
pub struct Services {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, replacing any previous one of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, service: T) -> &mut Self {
        self.insert_arc(Arc::new(service))
    }

    /// Register an already shared service.
    pub fn insert_arc<T: Send + Sync + 'static>(&mut self, service: Arc<T>) -> &mut Self {
        self.entries.insert(TypeId::of::<T>(), service);
        self
    }

    /// Builder-style insert.
    pub fn with<T: Send + Sync + 'static>(mut self, service: T) -> Self {
        self.insert(service);
        self
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }

    pub fn contains(&self, requirement: &ServiceRequirement) -> bool {
        self.entries.contains_key(&requirement.type_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Context handed to an activity body.
#[derive(Clone)]
pub struct ActivityContext {
    workflow_id: String,
    sequence_id: i64,
    scheduled_for: DateTime<Utc>,
    clock: Arc<dyn Clock>,
    services: Arc<Services>,
}

impl ActivityContext {
    pub fn new(
        workflow_id: impl Into<String>,
        sequence_id: i64,
        scheduled_for: DateTime<Utc>,
        clock: Arc<dyn Clock>,
        services: Arc<Services>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            sequence_id,
            scheduled_for,
            clock,
            services,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Sequence number of the history entry being executed.
    pub fn sequence_id(&self) -> i64 {
        self.sequence_id
    }

    /// The ETA the call site was scheduled for.
    pub fn scheduled_for(&self) -> DateTime<Utc> {
        self.scheduled_for
    }

    /// Current wall-clock time. Activities may be non-deterministic.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Resolve an injected service.
    pub fn service<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.services.get::<T>().ok_or_else(|| {
            SkeinError::Config(format!(
                "service {} is not registered",
                std::any::type_name::<T>()
            ))
        })
    }
}

/// Type-erased activity body: stored parameters in, serialized result out.
pub type BoxedActivityHandler = Arc<
    dyn Fn(ActivityContext, serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value>>
        + Send
        + Sync,
>;

/// Registration-time description of an activity, built once.
#[derive(Debug, Clone)]
pub struct ActivityDescriptor {
    pub name: &'static str,
    /// Type name of the data argument.
    pub args_type: &'static str,
    /// Type name of the result.
    pub output_type: &'static str,
    /// Injected services; excluded from keys and history.
    pub services: Vec<ServiceRequirement>,
}

/// A registered activity.
#[derive(Clone)]
pub struct RegisteredActivity {
    pub descriptor: ActivityDescriptor,
    pub handler: BoxedActivityHandler,
}

impl RegisteredActivity {
    fn new<A: Activity>() -> Self {
        let info = A::info();
        let handler: BoxedActivityHandler = Arc::new(
            |ctx: ActivityContext,
             params: serde_json::Value|
             -> BoxFuture<'static, Result<serde_json::Value>> {
                Box::pin(async move {
                    let args: A::Args = serde_json::from_value(params)
                        .map_err(|e| SkeinError::Deserialization(e.to_string()))?;
                    let output = A::run(ctx, args).await?;
                    serde_json::to_value(output).map_err(SkeinError::from)
                })
            },
        );

        Self {
            descriptor: ActivityDescriptor {
                name: info.name,
                args_type: std::any::type_name::<A::Args>(),
                output_type: std::any::type_name::<A::Output>(),
                services: info.services,
            },
            handler,
        }
    }
}

/// Collects the activities a workflow declares.
#[derive(Default)]
pub struct ActivitySet {
    entries: HashMap<&'static str, RegisteredActivity>,
    errors: Vec<String>,
}

impl ActivitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an activity.
    pub fn add<A: Activity>(&mut self) -> &mut Self {
        let activity = RegisteredActivity::new::<A>();
        let name = activity.descriptor.name;

        if name.trim().is_empty() {
            self.errors.push(format!(
                "activity {} has an empty name",
                std::any::type_name::<A>()
            ));
        } else if self.entries.contains_key(name) {
            self.errors
                .push(format!("activity name '{}' is declared twice", name));
        } else {
            self.entries.insert(name, activity);
        }
        self
    }

    /// Finish registration, rejecting invalid declarations.
    pub fn build(self) -> Result<ActivityTable> {
        if !self.errors.is_empty() {
            return Err(SkeinError::Config(self.errors.join("; ")));
        }
        Ok(ActivityTable {
            entries: self.entries,
        })
    }
}

/// Activities of one workflow type, keyed by name.
#[derive(Clone, Default)]
pub struct ActivityTable {
    entries: HashMap<&'static str, RegisteredActivity>,
}

impl ActivityTable {
    pub fn get(&self, name: &str) -> Option<&RegisteredActivity> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ActivityDescriptor> {
        self.entries.values().map(|a| &a.descriptor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check that every injected service is present in the container.
    pub fn check_services(&self, services: &Services) -> Result<()> {
        let missing: Vec<String> = self
            .descriptors()
            .flat_map(|d| {
                d.services
                    .iter()
                    .filter(|req| !services.contains(req))
                    .map(move |req| format!("{} requires {}", d.name, req.type_name))
            })
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(SkeinError::Config(format!(
                "missing services: {}",
                missing.join(", ")
            )))
        }
    }
}
