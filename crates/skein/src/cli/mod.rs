mod inspect;
mod migrate;
mod raise;

pub use inspect::{HistoryCommand, PendingCommand, StatusCommand};
pub use migrate::MigrateCommand;
pub use raise::RaiseCommand;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use skein::init_tracing;
use skein_core::clock::SystemClock;
use skein_core::config::SkeinConfig;
use skein_core::workflow::Services;
use skein_runtime::{PgStore, WorkflowEngine, WorkflowRegistry};

/// skein - durable workflow engine
#[derive(Parser)]
#[command(name = "skein")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Apply database migrations.
    Migrate(MigrateCommand),

    /// Show the status of a workflow.
    Status(StatusCommand),

    /// List the recorded call sites of a workflow.
    History(HistoryCommand),

    /// List the queued wake-ups of a workflow.
    Pending(PendingCommand),

    /// Deliver an event to a waiting workflow.
    Raise(RaiseCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Migrate(cmd) => cmd.execute().await,
            Commands::Status(cmd) => cmd.execute().await,
            Commands::History(cmd) => cmd.execute().await,
            Commands::Pending(cmd) => cmd.execute().await,
            Commands::Raise(cmd) => cmd.execute().await,
        }
    }
}

/// Options shared by every command that talks to the database.
#[derive(Args, Clone)]
pub struct ConnectionArgs {
    /// Configuration file path.
    #[arg(short, long, default_value = "skein.toml")]
    pub config: String,

    /// Database URL (overrides the configuration file).
    #[arg(long)]
    pub database_url: Option<String>,
}

impl ConnectionArgs {
    /// Load configuration from the file, `.env` and overrides.
    pub fn load_config(&self) -> Result<SkeinConfig> {
        dotenvy::dotenv().ok();

        let mut config = if Path::new(&self.config).exists() {
            SkeinConfig::from_file(&self.config)?
        } else if let Some(url) = &self.database_url {
            SkeinConfig::default_with_database_url(url)
        } else if let Ok(url) = std::env::var("DATABASE_URL") {
            SkeinConfig::default_with_database_url(&url)
        } else {
            anyhow::bail!(
                "Configuration file not found: {}\nPass --database-url or set DATABASE_URL.",
                self.config
            );
        };

        if let Some(url) = &self.database_url {
            config.database.url = url.clone();
        }

        init_tracing(&config.observability);
        Ok(config)
    }

    /// Connect to PostgreSQL.
    pub async fn connect(&self) -> Result<(SkeinConfig, PgStore)> {
        let config = self.load_config()?;
        let store = PgStore::connect(&config.database).await?;
        Ok((config, store))
    }

    /// An engine without registered workflows, enough for inspection and
    /// event delivery.
    pub async fn engine(&self) -> Result<WorkflowEngine> {
        let (config, store) = self.connect().await?;
        let engine = WorkflowEngine::new(
            Arc::new(store),
            Arc::new(SystemClock),
            WorkflowRegistry::new(),
            Services::new(),
            config.engine,
        )?;
        Ok(engine)
    }
}
