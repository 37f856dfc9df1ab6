mod checkpoint;
mod scrape;

use clap::{Parser, Subcommand};
use stromdb_core::Period;
use tracing_subscriber::EnvFilter;

use crate::checkpoint::CheckpointCommands;

#[derive(Debug, Parser)]
#[command(name = "stromdb-cli")]
#[command(about = "Electricity price scraper with resumable sessions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape prices for one period, resuming from a checkpoint if present
    Scrape(ScrapeArgs),
    /// Inspect or remove the checkpoint for a period
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Apply pending database migrations
    Migrate,
}

#[derive(Debug, Clone, clap::Args)]
struct ScrapeArgs {
    /// Period to scrape (YYYY-MM); defaults to the current month
    #[arg(long)]
    period: Option<Period>,

    /// Keep going after each batch instead of pausing
    #[arg(long)]
    auto_progress: bool,

    /// Skip geographic fallback completion
    #[arg(long)]
    no_fallback: bool,

    /// Re-scrape targets that already have a record for the period
    #[arg(long)]
    overwrite: bool,

    /// Only process the first N targets
    #[arg(long)]
    limit: Option<usize>,

    /// Run against in-memory storage without touching the database
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let Some(command) = cli.command else {
        println!("stromdb-cli: run with --help for available commands");
        return Ok(());
    };

    let config = stromdb_core::load_app_config()?;
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.clone()))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match command {
        Commands::Scrape(args) => scrape::run_scrape(&config, &args).await,
        Commands::Checkpoint { command } => checkpoint::run_checkpoint(&config, command).await,
        Commands::Migrate => {
            let pool_config = stromdb_db::PoolConfig::from_app_config(&config);
            let pool = stromdb_db::connect_pool(&config.database_url, pool_config).await?;
            let applied = stromdb_db::run_migrations(&pool).await?;
            println!("applied {applied} migration(s)");
            Ok(())
        }
    }
}
