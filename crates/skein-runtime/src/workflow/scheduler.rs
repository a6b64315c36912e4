use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::engine::WorkflowEngine;
use skein_core::Result;

/// Poll loop that keeps calling [`WorkflowEngine::process_due`].
pub struct WorkflowScheduler {
    engine: Arc<WorkflowEngine>,
    poll_interval: Duration,
}

impl WorkflowScheduler {
    /// Create a scheduler ticking at the engine's `poll_interval_ms`.
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        let poll_interval = engine.config().poll_interval();
        Self {
            engine,
            poll_interval,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run the scheduler until shutdown.
    ///
    /// A cycle that is already dispatching finishes before shutdown is
    /// observed.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            poll_interval = ?self.poll_interval,
            batch_size = self.engine.config().batch_size,
            "Workflow scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.drain().await {
                        tracing::error!(error = %e, "Failed to process due workflows");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Workflow scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// Process due work until a batch comes back short.
    async fn drain(&self) -> Result<usize> {
        let batch_size = self.engine.config().batch_size;
        let mut total = 0;
        loop {
            let dispatched = self.engine.process_due().await?;
            total += dispatched;
            if dispatched < batch_size {
                break;
            }
        }
        if total > 0 {
            tracing::debug!(count = total, "Processed due workflows");
        }
        Ok(total)
    }
}
