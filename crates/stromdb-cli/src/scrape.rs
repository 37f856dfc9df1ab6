//! `scrape` command: wires config, targets, storage and checkpoints into a
//! [`SessionController`] run and reports the outcome.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use stromdb_core::{
    load_targets, AppConfig, DuplicateMode, Period, PipelineConfig, ReferenceTable,
    StorageBackend, Target,
};
use stromdb_pipeline::{
    CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, MemoryStorage, RunOutcome,
    SessionController,
};
use stromdb_scraper::HttpFetcher;

use crate::ScrapeArgs;

/// Applies command-line overrides on top of the env-derived pipeline config.
pub(crate) fn pipeline_config(base: &PipelineConfig, args: &ScrapeArgs) -> PipelineConfig {
    let mut config = base.clone();
    if args.auto_progress {
        config.auto_progress = true;
    }
    if args.no_fallback {
        config.fallback_enabled = false;
    }
    if args.overwrite {
        config.duplicate_mode = DuplicateMode::Overwrite;
    }
    config
}

/// Truncates `targets` to `limit`. A limited run has a different target
/// count, so it never resumes a checkpoint written by an unlimited one.
pub(crate) fn limit_targets(mut targets: Vec<Target>, limit: Option<usize>) -> Vec<Target> {
    if let Some(limit) = limit {
        targets.truncate(limit);
    }
    targets
}

/// Builds the reference table from every loaded target, then applies
/// `limit`. Targets left out of a limited run still supply coordinates for
/// fallback resolution.
pub(crate) fn plan_targets(
    all: Vec<Target>,
    limit: Option<usize>,
) -> (ReferenceTable, Vec<Target>) {
    let reference = ReferenceTable::from_targets(&all);
    (reference, limit_targets(all, limit))
}

/// Runs one scrape invocation.
///
/// # Errors
///
/// Returns an error if targets cannot be loaded, the HTTP client or database
/// pool cannot be built, or the session fails.
pub(crate) async fn run_scrape(config: &AppConfig, args: &ScrapeArgs) -> anyhow::Result<()> {
    let period = args.period.unwrap_or_else(|| Period::containing(Utc::now()));
    let pipeline = pipeline_config(&config.pipeline, args);

    let targets = load_targets(&config.targets_path).with_context(|| {
        format!("failed to load targets from {}", config.targets_path.display())
    })?;
    let (reference, targets) = plan_targets(targets, args.limit);
    let reference = Arc::new(reference);
    tracing::info!(
        %period,
        targets = targets.len(),
        with_coordinates = reference.len(),
        dry_run = args.dry_run,
        "starting scrape"
    );

    let fetcher = Arc::new(HttpFetcher::new(
        config.scraper_request_timeout_secs,
        &config.scraper_user_agent,
    )?);

    let (storage, checkpoints): (Arc<dyn StorageBackend>, Arc<dyn CheckpointStore>) =
        if args.dry_run {
            (
                Arc::new(MemoryStorage::new()),
                Arc::new(MemoryCheckpointStore::new()),
            )
        } else {
            let pool_config = stromdb_db::PoolConfig::from_app_config(config);
            let pool = stromdb_db::connect_pool(&config.database_url, pool_config).await?;
            (
                Arc::new(stromdb_db::PgStorage::new(pool)),
                Arc::new(FileCheckpointStore::new(&config.checkpoint_dir)),
            )
        };

    let mut controller = SessionController::new(
        fetcher,
        storage,
        checkpoints,
        reference,
        pipeline,
        config.source_url_template.clone(),
    );

    match controller.run(period, &targets).await? {
        RunOutcome::Completed(summary) => {
            println!("scrape for {period} completed");
            println!("{summary}");
        }
        RunOutcome::Paused {
            next_batch_index,
            total_batches,
            processed,
        } => {
            println!(
                "scrape for {period} paused after batch {next_batch_index}/{total_batches} \
                 ({processed} targets processed); run again to continue"
            );
        }
    }
    Ok(())
}
