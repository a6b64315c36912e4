use anyhow::{Context, Result};
use clap::Parser;
use console::style;

use super::ConnectionArgs;

/// Deliver an event to a waiting workflow.
#[derive(Parser)]
pub struct RaiseCommand {
    /// Workflow ID.
    pub workflow_id: String,

    /// Event name.
    pub event: String,

    /// Event value as JSON.
    #[arg(long, default_value = "null")]
    pub value: String,

    /// Fail if the workflow is not waiting for the event.
    #[arg(long)]
    pub require_waiter: bool,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

impl RaiseCommand {
    pub fn value(&self) -> Result<serde_json::Value> {
        serde_json::from_str(&self.value).context("--value must be valid JSON")
    }

    pub async fn execute(self) -> Result<()> {
        let value = self.value()?;
        let engine = self.connection.engine().await?;

        let delivered = engine
            .raise_event(&self.workflow_id, &self.event, value, self.require_waiter)
            .await?;

        if delivered {
            println!(
                "  {} Delivered {} to {}",
                style("✓").green(),
                style(&self.event).bold(),
                self.workflow_id
            );
        } else {
            println!(
                "  {} {} is not waiting for {}",
                style("ℹ").blue(),
                self.workflow_id,
                self.event
            );
        }
        Ok(())
    }
}
