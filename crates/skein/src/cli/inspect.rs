use anyhow::Result;
use clap::Parser;
use console::style;

use skein_core::workflow::{ActivityStatus, WorkflowStatus};

use super::ConnectionArgs;

/// Show the status of a workflow.
#[derive(Parser)]
pub struct StatusCommand {
    /// Workflow ID.
    pub workflow_id: String,

    /// Print the raw snapshot as JSON.
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

impl StatusCommand {
    pub async fn execute(self) -> Result<()> {
        let engine = self.connection.engine().await?;
        let snapshot = engine.status(&self.workflow_id).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            return Ok(());
        }

        let status = match snapshot.status {
            WorkflowStatus::Completed => style(snapshot.status.as_str()).green(),
            WorkflowStatus::Failed => style(snapshot.status.as_str()).red(),
            WorkflowStatus::Suspended => style(snapshot.status.as_str()).yellow(),
            WorkflowStatus::Running => style(snapshot.status.as_str()).cyan(),
        };

        println!();
        println!("  {} {}", style(&snapshot.id).bold(), status);
        println!("  type:         {}", snapshot.workflow_type);
        println!("  created:      {}", snapshot.created_at);
        println!("  last updated: {}", snapshot.last_updated);
        if let Some(result) = &snapshot.result {
            println!("  result:       {}", result);
        }
        if let Some(error) = &snapshot.error {
            println!("  error:        {}", style(error).red());
        }
        println!();
        Ok(())
    }
}

/// List the recorded call sites of a workflow.
#[derive(Parser)]
pub struct HistoryCommand {
    /// Workflow ID.
    pub workflow_id: String,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

impl HistoryCommand {
    pub async fn execute(self) -> Result<()> {
        let engine = self.connection.engine().await?;
        let steps = engine.history(&self.workflow_id).await?;

        println!();
        if steps.is_empty() {
            println!("  {} No recorded call sites", style("ℹ").blue());
            println!();
            return Ok(());
        }

        for step in &steps {
            let marker = match step.status {
                ActivityStatus::Completed => style("✓").green(),
                ActivityStatus::Failed => style("✗").red(),
                ActivityStatus::Running => style("…").yellow(),
            };
            println!(
                "  {} {:>3}  {:<8} {:<24} eta {}",
                marker,
                step.sequence_id,
                step.kind.as_str(),
                step.name,
                step.eta
            );
            if let Some(error) = &step.error {
                println!("         {}", style(error).red());
            }
        }
        println!();
        Ok(())
    }
}

/// List the queued wake-ups of a workflow.
#[derive(Parser)]
pub struct PendingCommand {
    /// Workflow ID.
    pub workflow_id: String,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

impl PendingCommand {
    pub async fn execute(self) -> Result<()> {
        let engine = self.connection.engine().await?;
        let items = engine.pending_wakeups(&self.workflow_id).await?;

        println!();
        if items.is_empty() {
            println!("  {} No pending wake-ups", style("ℹ").blue());
        }
        for item in &items {
            let leased = match item.leased_until {
                Some(until) => format!(" (leased until {})", until),
                None => String::new(),
            };
            println!("  {} {}  due {}{}", style("→").dim(), item.token, item.due_at, leased);
        }
        println!();
        Ok(())
    }
}
