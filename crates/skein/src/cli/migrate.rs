use anyhow::Result;
use clap::Parser;
use console::style;

use super::ConnectionArgs;

/// Apply database migrations.
#[derive(Parser)]
pub struct MigrateCommand {
    #[command(flatten)]
    pub connection: ConnectionArgs,
}

impl MigrateCommand {
    pub async fn execute(self) -> Result<()> {
        let (_, store) = self.connection.connect().await?;

        println!();
        println!("  {} Migrations", style("skein").bold().cyan());
        println!();
        println!("  {} Running pending migrations...", style("→").dim());

        let applied = store.migrate().await?;
        if applied.is_empty() {
            println!("  {} Schema is up to date", style("ℹ").blue());
        } else {
            for name in &applied {
                println!("  {} Applied: {}", style("✓").green(), name);
            }
        }
        println!();
        Ok(())
    }
}
