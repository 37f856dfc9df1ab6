//! `checkpoint` command: inspect or discard the checkpoint file of a period.

use clap::Subcommand;
use stromdb_core::{AppConfig, Period};
use stromdb_pipeline::{CheckpointStore, FileCheckpointStore};

#[derive(Debug, Subcommand)]
pub enum CheckpointCommands {
    /// Print the checkpoint for a period as JSON
    Show {
        #[arg(long)]
        period: Period,
    },
    /// Delete the checkpoint so the next run starts a fresh session
    Clear {
        #[arg(long)]
        period: Period,
    },
}

pub(crate) async fn run_checkpoint(
    config: &AppConfig,
    command: CheckpointCommands,
) -> anyhow::Result<()> {
    let store = FileCheckpointStore::new(&config.checkpoint_dir);
    match command {
        CheckpointCommands::Show { period } => match store.load(period).await? {
            Some(checkpoint) => {
                println!("{}", serde_json::to_string_pretty(&checkpoint)?);
            }
            None => println!("no checkpoint for {period}"),
        },
        CheckpointCommands::Clear { period } => {
            store.clear(period).await?;
            tracing::info!(%period, path = %store.path_for(period).display(), "checkpoint cleared");
            println!("checkpoint for {period} cleared");
        }
    }
    Ok(())
}
