//! Process wiring for skein.
//!
//! Builds an engine from configuration, a store, a clock, registered
//! workflows and injected services, and runs its scheduler until shutdown.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use skein_core::clock::{Clock, SystemClock};
use skein_core::config::{ObservabilityConfig, SkeinConfig};
use skein_core::error::{Result, SkeinError};
use skein_core::store::WorkflowStore;
use skein_core::workflow::{Services, Workflow, WorkflowSnapshot};
use skein_runtime::{PgStore, WorkflowEngine, WorkflowRegistry, WorkflowScheduler};

/// Prelude module for common imports.
pub mod prelude {
    pub use chrono::{DateTime, Utc};
    pub use std::time::Duration;

    pub use skein_core::clock::{Clock, MockClock, SystemClock};
    pub use skein_core::config::SkeinConfig;
    pub use skein_core::error::{Result, SkeinError};
    pub use skein_core::workflow::{
        Activity, ActivityContext, ActivityInfo, ActivitySet, EventResult, Workflow,
        WorkflowContext, WorkflowInfo, WorkflowStatus,
    };
    pub use skein_runtime::{DispatchOutcome, MemoryStore, WorkflowEngine};

    pub use crate::{Skein, SkeinBuilder};
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Does nothing if a
/// subscriber is already installed.
pub fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// A configured skein process.
pub struct Skein {
    config: SkeinConfig,
    engine: Arc<WorkflowEngine>,
    shutdown: CancellationToken,
}

impl Skein {
    /// Create a new builder.
    pub fn builder() -> SkeinBuilder {
        SkeinBuilder::new()
    }

    pub fn config(&self) -> &SkeinConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Start workflow `W` with a generated ID.
    pub async fn start<W: Workflow>(&self, input: W::Input) -> Result<String> {
        self.engine.start::<W>(input).await
    }

    /// Deliver an event to a waiting workflow.
    pub async fn raise_event<T: Serialize>(
        &self,
        workflow_id: &str,
        name: &str,
        value: T,
    ) -> Result<bool> {
        self.engine.raise_event(workflow_id, name, value, false).await
    }

    pub async fn status(&self, workflow_id: &str) -> Result<WorkflowSnapshot> {
        self.engine.status(workflow_id).await
    }

    /// Token that stops [`Skein::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run the scheduler until Ctrl-C or [`Skein::shutdown`].
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            workflows = ?self.engine.registry().names(),
            "skein runtime starting"
        );

        let scheduler = WorkflowScheduler::new(self.engine.clone());
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move { scheduler.run(token).await });

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("Received shutdown notification");
            }
        }

        self.shutdown.cancel();
        handle
            .await
            .map_err(|e| SkeinError::Internal(format!("scheduler task failed: {}", e)))?;

        tracing::info!("skein runtime stopped");
        Ok(())
    }
}

/// Builder for [`Skein`].
pub struct SkeinBuilder {
    config: Option<SkeinConfig>,
    store: Option<Arc<dyn WorkflowStore>>,
    clock: Option<Arc<dyn Clock>>,
    registry: WorkflowRegistry,
    services: Services,
}

impl SkeinBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            store: None,
            clock: None,
            registry: WorkflowRegistry::new(),
            services: Services::new(),
        }
    }

    pub fn config(mut self, config: SkeinConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use `store` instead of connecting to PostgreSQL.
    pub fn store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `clock` instead of the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Register workflow `W` and its activities.
    pub fn workflow<W: Workflow>(mut self) -> Result<Self> {
        self.registry.register::<W>()?;
        Ok(self)
    }

    /// Make `service` available to activities.
    pub fn service<T: Send + Sync + 'static>(mut self, service: T) -> Self {
        self.services.insert(service);
        self
    }

    pub fn registry_mut(&mut self) -> &mut WorkflowRegistry {
        &mut self.registry
    }

    /// Connect and assemble the engine.
    ///
    /// Without an explicit store this connects to `database.url`, applying
    /// migrations when `database.run_migrations` is set.
    pub async fn build(self) -> Result<Skein> {
        let config = self.config.unwrap_or_default();

        let store: Arc<dyn WorkflowStore> = match self.store {
            Some(store) => store,
            None => {
                if config.database.url.is_empty() {
                    return Err(SkeinError::Config(
                        "database.url is required when no store is provided".into(),
                    ));
                }
                Arc::new(PgStore::connect(&config.database).await?)
            }
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let engine = WorkflowEngine::new(
            store,
            clock,
            self.registry,
            self.services,
            config.engine.clone(),
        )?;

        Ok(Skein {
            config,
            engine: Arc::new(engine),
            shutdown: CancellationToken::new(),
        })
    }
}

impl Default for SkeinBuilder {
    fn default() -> Self {
        Self::new()
    }
}
