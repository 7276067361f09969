use anyhow::Result;
use clap::{Parser, Subcommand};
use p2n_store::{MemoryDestination, NotionClient, NotionConfig, SyncLedger};
use p2n_sync::SyncConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "p2n")]
#[command(about = "Mirror Plaud recordings into a Notion database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one mirror pass over the latest capture file.
    Sync {
        /// Reconcile against an in-memory destination; writes nothing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the synchronized-identity ledger.
    Ledger,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            let config = SyncConfig::from_env(dry_run)?;
            let summary = if dry_run {
                let dest = MemoryDestination::with_default_schema();
                p2n_sync::run_once(&config, &dest).await?
            } else {
                let dest = NotionClient::new(NotionConfig::new(
                    &config.notion_token,
                    &config.notion_database_id,
                ))?;
                p2n_sync::run_once(&config, &dest).await?
            };
            println!(
                "sync complete: run_id={} created={} updated={} low_signal={} identity_less={} already_synced={} failures={}",
                summary.run_id,
                summary.created,
                summary.updated,
                summary.low_signal_skipped,
                summary.identity_less_skipped,
                summary.already_synced_skipped,
                summary.write_failures,
            );
        }
        Commands::Ledger => {
            let config = SyncConfig::from_env(true)?;
            let ledger = SyncLedger::load(&config.ledger_path);
            println!(
                "{} identities synced ({})",
                ledger.len(),
                config.ledger_path.display()
            );
        }
    }

    Ok(())
}
