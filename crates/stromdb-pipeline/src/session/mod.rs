//! The session controller: batched, checkpointed, resumable scraping of one
//! period.
//!
//! Targets are processed strictly one at a time with a fixed delay between
//! fetches. Progress is checkpointed every `checkpoint_interval` targets and
//! at each batch boundary; a later invocation with the same target list
//! resumes from the checkpoint without re-fetching anything already
//! processed.

mod phase;
mod state;
mod summary;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stromdb_core::{
    DataSource, DuplicateMode, ErrorCategory, ErrorEntry, Period, PipelineConfig, PriceRecord,
    ReferenceData, StorageBackend, StorageError, Target,
};
use stromdb_scraper::{
    check_page, extract, page_text, pause, retry_with_delay, source_url, FetchError, Fetcher,
};
use thiserror::Error;

use crate::buffer::{persistable, BufferedStorage, StorageRetry};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::fallback::find_fallback;
use crate::quality::{assess_outliers, validate_record};

pub use phase::SessionPhase;
pub use state::SessionState;
pub use summary::RunSummary;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid run input: {0}")]
    InvalidInput(String),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("checkpoint failure: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition { from: SessionPhase, to: SessionPhase },

    #[error("failed to serialize session data: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// How an invocation of [`SessionController::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// A batch finished and auto-progress is off. Invoke again to continue.
    Paused {
        next_batch_index: usize,
        total_batches: usize,
        processed: usize,
    },
    Completed(RunSummary),
}

/// One target with its source URL.
struct PlannedTarget<'a> {
    target: &'a Target,
    url: String,
}

/// The target list split into equally sized batches.
struct BatchPlan<'a> {
    entries: Vec<PlannedTarget<'a>>,
    chunk_size: usize,
    total_batches: usize,
}

impl<'a> BatchPlan<'a> {
    fn new(
        targets: &'a [Target],
        batch_count: usize,
        url_template: &str,
    ) -> Result<Self, SessionError> {
        if targets.is_empty() {
            return Err(SessionError::InvalidInput("no targets to process".to_owned()));
        }

        let mut seen = HashSet::with_capacity(targets.len());
        let mut entries = Vec::with_capacity(targets.len());
        for target in targets {
            if !seen.insert(target.location_id.as_str()) {
                return Err(SessionError::InvalidInput(format!(
                    "duplicate location id \"{}\"",
                    target.location_id
                )));
            }
            let url = source_url(url_template, target)
                .map_err(|e| SessionError::InvalidInput(e.to_string()))?;
            entries.push(PlannedTarget { target, url });
        }

        let requested = batch_count.clamp(1, targets.len());
        let chunk_size = targets.len().div_ceil(requested);
        let total_batches = targets.len().div_ceil(chunk_size);
        Ok(Self {
            entries,
            chunk_size,
            total_batches,
        })
    }

    fn total_targets(&self) -> usize {
        self.entries.len()
    }

    fn batch(&self, index: usize) -> &[PlannedTarget<'a>] {
        self.entries
            .chunks(self.chunk_size)
            .nth(index)
            .unwrap_or_default()
    }
}

fn error_entry(
    target: &Target,
    period: Period,
    category: ErrorCategory,
    message: String,
    attempts: u32,
    url: &str,
) -> ErrorEntry {
    ErrorEntry {
        location_id: target.location_id.clone(),
        period,
        category,
        message,
        attempts,
        url: Some(url.to_owned()),
        occurred_at: Utc::now(),
    }
}

/// Drives one period's run across fetcher, extractor, validator, storage
/// and checkpoints.
pub struct SessionController {
    fetcher: Arc<dyn Fetcher>,
    storage: Arc<dyn StorageBackend>,
    checkpoints: Arc<dyn CheckpointStore>,
    reference: Arc<dyn ReferenceData>,
    config: PipelineConfig,
    source_url_template: String,
    phase: SessionPhase,
}

impl SessionController {
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        storage: Arc<dyn StorageBackend>,
        checkpoints: Arc<dyn CheckpointStore>,
        reference: Arc<dyn ReferenceData>,
        config: PipelineConfig,
        source_url_template: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            storage,
            checkpoints,
            reference,
            config,
            source_url_template: source_url_template.into(),
            phase: SessionPhase::Uninitialized,
        }
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    fn transition(&mut self, next: SessionPhase) -> Result<(), SessionError> {
        if !self.phase.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::debug!(from = %self.phase, to = %next, "session phase change");
        self.phase = next;
        Ok(())
    }

    fn storage_retry(&self) -> StorageRetry {
        StorageRetry::from_config(&self.config)
    }

    /// Saves `checkpoint` under the storage retry policy. Only transient
    /// checkpoint errors are retried.
    async fn store_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let retry = self.storage_retry();
        let checkpoints = &self.checkpoints;
        retry_with_delay(
            retry.max_attempts,
            retry.delay,
            CheckpointError::is_transient,
            move |_| checkpoints.save(checkpoint),
        )
        .await
        .result
    }

    /// Runs (or resumes) the session for `period` over `targets`.
    ///
    /// Returns [`RunOutcome::Paused`] at a batch boundary when auto-progress
    /// is off, otherwise continues through fallback completion and
    /// finalization.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidInput`] for an empty or duplicated
    /// target list, before any session is created. Storage or checkpoint
    /// failures mark the session failed, leave a checkpoint behind and are
    /// returned.
    pub async fn run(
        &mut self,
        period: Period,
        targets: &[Target],
    ) -> Result<RunOutcome, SessionError> {
        self.transition(SessionPhase::Starting)?;

        let plan = match BatchPlan::new(
            targets,
            self.config.batch_count,
            &self.source_url_template,
        ) {
            Ok(plan) => plan,
            Err(err) => {
                self.phase = SessionPhase::Failed;
                return Err(err);
            }
        };

        let mut state = match self.start_or_resume(period, &plan).await {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(%period, error = %err, "session could not start");
                self.phase = SessionPhase::Failed;
                return Err(err);
            }
        };
        let mut buffer = BufferedStorage::new(Arc::clone(&self.storage), &self.config);

        match self.drive(&plan, &mut state, &mut buffer).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.fail(&mut state, &mut buffer, &err).await;
                Err(err)
            }
        }
    }

    async fn start_or_resume(
        &self,
        period: Period,
        plan: &BatchPlan<'_>,
    ) -> Result<SessionState, SessionError> {
        let config_snapshot = serde_json::to_value(&self.config)?;
        let retry = self.storage_retry();
        let storage = &self.storage;

        match self.checkpoints.load(period).await {
            Ok(Some(checkpoint))
                if checkpoint.period == period
                    && checkpoint.is_compatible(plan.total_targets(), plan.total_batches) =>
            {
                let id = checkpoint.session_id;
                match retry.run(move |_| storage.resume_session(id)).await {
                    Ok(()) => {
                        tracing::info!(
                            %period,
                            session_id = id,
                            batch_index = checkpoint.batch_index,
                            total_batches = checkpoint.total_batches,
                            processed = checkpoint.processed_ids.len(),
                            "resuming session from checkpoint"
                        );
                        return Ok(SessionState::from_checkpoint(checkpoint, config_snapshot));
                    }
                    Err(
                        err @ (StorageError::InvalidSessionTransition { .. }
                        | StorageError::SessionNotFound(_)),
                    ) => {
                        tracing::warn!(
                            %period,
                            session_id = id,
                            error = %err,
                            "checkpointed session cannot be resumed; starting fresh"
                        );
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Ok(Some(checkpoint)) => {
                tracing::warn!(
                    %period,
                    checkpoint_targets = checkpoint.total_targets,
                    checkpoint_batches = checkpoint.total_batches,
                    targets = plan.total_targets(),
                    batches = plan.total_batches,
                    "checkpoint does not match this run; starting fresh"
                );
            }
            Ok(None) => {}
            Err(err @ CheckpointError::Corrupt { .. }) => {
                tracing::warn!(%period, error = %err, "unreadable checkpoint; starting fresh");
            }
            Err(err) => return Err(err.into()),
        }

        self.checkpoints.clear(period).await?;

        let total_targets = plan.total_targets();
        let snapshot = &config_snapshot;
        let session_id = retry
            .run(move |_| storage.start_session(period, total_targets, snapshot))
            .await?;
        tracing::info!(
            %period,
            session_id,
            total_targets,
            total_batches = plan.total_batches,
            "session started"
        );
        Ok(SessionState::fresh(
            session_id,
            period,
            plan.total_batches,
            total_targets,
            config_snapshot,
        ))
    }

    async fn drive(
        &mut self,
        plan: &BatchPlan<'_>,
        state: &mut SessionState,
        buffer: &mut BufferedStorage,
    ) -> Result<RunOutcome, SessionError> {
        let retry = self.storage_retry();
        let period = state.period;
        let existing: HashSet<String> = match self.config.duplicate_mode {
            DuplicateMode::Skip => {
                let storage = &self.storage;
                retry.run(move |_| storage.bulk_existing_ids(period)).await?
            }
            DuplicateMode::Overwrite => HashSet::new(),
        };

        let mut fetched_any = false;
        while state.batch_index < state.total_batches {
            self.transition(SessionPhase::BatchActive)?;
            let batch_index = state.batch_index;
            tracing::info!(
                %period,
                batch_index,
                total_batches = state.total_batches,
                "batch started"
            );

            for planned in plan.batch(batch_index) {
                let location_id = planned.target.location_id.as_str();
                if state.processed_ids.contains(location_id) {
                    continue;
                }
                if existing.contains(location_id) {
                    tracing::debug!(location_id, "record exists for period; skipping");
                    state.summary.skipped_existing += 1;
                    continue;
                }

                if fetched_any {
                    pause(self.config.inter_request_delay_ms).await;
                }
                fetched_any = true;

                self.process_target(state, buffer, planned).await?;
                if state.mark_processed(location_id, self.config.checkpoint_interval) {
                    self.save_checkpoint(state, buffer).await?;
                }
            }

            // The batch index only advances once every write of the batch is stored.
            buffer.flush(state.session_id).await?;
            state.batch_index += 1;
            self.save_checkpoint(state, buffer).await?;
            tracing::info!(
                %period,
                batch_index,
                processed = state.processed_ids.len(),
                results = state.accumulated_result_count,
                errors = state.accumulated_error_count,
                "batch finished"
            );

            if state.batch_index < state.total_batches {
                self.transition(SessionPhase::BatchPaused)?;
                if !self.config.auto_progress {
                    tracing::info!(
                        %period,
                        next_batch_index = state.batch_index,
                        "auto-progress off; pausing session"
                    );
                    return Ok(RunOutcome::Paused {
                        next_batch_index: state.batch_index,
                        total_batches: state.total_batches,
                        processed: state.processed_ids.len(),
                    });
                }
                pause(self.config.inter_batch_pause_ms).await;
            }
        }

        if self.config.fallback_enabled {
            self.transition(SessionPhase::FallbackPending)?;
            self.complete_with_fallback(plan, state, buffer).await?;
        }

        self.finalize(state, buffer).await
    }

    /// Flushes everything, completes the session row and removes the
    /// checkpoint.
    async fn finalize(
        &mut self,
        state: &SessionState,
        buffer: &mut BufferedStorage,
    ) -> Result<RunOutcome, SessionError> {
        self.transition(SessionPhase::Finalizing)?;
        buffer.flush(state.session_id).await?;

        let period = state.period;
        let session_id = state.session_id;
        let summary = serde_json::to_value(&state.summary)?;
        let storage = &self.storage;
        let summary_ref = &summary;
        self.storage_retry()
            .run(move |_| storage.complete_session(session_id, summary_ref))
            .await?;
        if let Err(err) = self.checkpoints.clear(period).await {
            tracing::warn!(%period, error = %err, "failed to remove checkpoint after completion");
        }
        self.transition(SessionPhase::Completed)?;

        tracing::info!(
            %period,
            session_id,
            fetched = state.summary.fetched,
            persisted = state.summary.persisted,
            errors = state.summary.error_count(),
            fallback_persisted = state.summary.fallback_persisted,
            "session completed"
        );
        Ok(RunOutcome::Completed(state.summary.clone()))
    }

    /// Fetch, check, extract and validate one target, queueing either a
    /// record or an error entry.
    async fn process_target(
        &self,
        state: &mut SessionState,
        buffer: &mut BufferedStorage,
        planned: &PlannedTarget<'_>,
    ) -> Result<(), SessionError> {
        let target = planned.target;
        let url = planned.url.as_str();
        let location_id = target.location_id.as_str();
        let fetcher = &self.fetcher;

        let attempted = retry_with_delay(
            self.config.max_retries,
            Duration::from_millis(self.config.retry_delay_ms),
            FetchError::is_retriable,
            move |attempt| {
                tracing::debug!(location_id, attempt, url, "fetching");
                fetcher.fetch(url)
            },
        )
        .await;
        state.summary.fetched += 1;
        let attempts = attempted.attempts;

        let page = match attempted.result {
            Ok(page) => page,
            Err(err) => {
                if matches!(err, FetchError::NotFound { .. }) {
                    tracing::info!(location_id, url, "no page for location");
                } else {
                    tracing::warn!(location_id, attempts, error = %err, "fetch failed");
                }
                let entry = error_entry(
                    target,
                    state.period,
                    err.category(),
                    err.to_string(),
                    attempts,
                    url,
                );
                return self.record_failure(state, buffer, entry).await;
            }
        };

        let text = page_text(&page.html);
        if let Err(err) = check_page(&page.html, &text) {
            tracing::warn!(location_id, error = %err, "unusable page");
            let entry = error_entry(
                target,
                state.period,
                ErrorCategory::InvalidPage,
                err.to_string(),
                attempts,
                url,
            );
            return self.record_failure(state, buffer, entry).await;
        }

        let result = extract(&page.html, &text, &self.config.price_band);
        if result.is_failed() {
            tracing::warn!(
                location_id,
                city_class = ?result.city_class,
                "no price could be extracted"
            );
            let entry = error_entry(
                target,
                state.period,
                ErrorCategory::ExtractionFailed,
                result.diagnostics.join("; "),
                attempts,
                url,
            );
            return self.record_failure(state, buffer, entry).await;
        }

        let mut record = PriceRecord::original(
            target,
            state.period,
            result.local_provider_price,
            result.green_energy_price,
            result.method,
            page.url,
        );
        record.outlier = assess_outliers(
            record.local_provider_price,
            record.green_energy_price,
            &self.config.outlier_thresholds,
        );

        let validation = validate_record(&record, &self.config.price_band);
        if !validation.valid {
            tracing::warn!(location_id, issues = ?validation.issues, "record failed validation");
            let entry = error_entry(
                target,
                state.period,
                ErrorCategory::ValidationFailed,
                validation.issues.join("; "),
                attempts,
                url,
            );
            return self.record_failure(state, buffer, entry).await;
        }

        if record.outlier.has_outlier {
            tracing::warn!(
                location_id,
                severity = %record.outlier.severity,
                warnings = ?record.outlier.warnings,
                "price outlier"
            );
        }
        tracing::debug!(
            location_id,
            method = %record.extraction_method,
            quality_score = validation.quality_score,
            average_price = ?record.average_price,
            "record extracted"
        );

        persistable(&record)?;
        state.count_record(&record);
        buffer.push_record(record).await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        state: &mut SessionState,
        buffer: &mut BufferedStorage,
        entry: ErrorEntry,
    ) -> Result<(), SessionError> {
        state.count_error(entry.category);
        buffer.push_error(state.session_id, entry).await?;
        Ok(())
    }

    /// Gives every target still without a record the prices of its nearest
    /// scraped neighbour.
    async fn complete_with_fallback(
        &self,
        plan: &BatchPlan<'_>,
        state: &mut SessionState,
        buffer: &mut BufferedStorage,
    ) -> Result<(), SessionError> {
        buffer.flush(state.session_id).await?;
        state.summary.fallback_unresolved = 0;

        let retry = self.storage_retry();
        let storage = &self.storage;
        let period = state.period;
        let existing = retry.run(move |_| storage.bulk_existing_ids(period)).await?;
        let originals: Vec<PriceRecord> = retry
            .run(move |_| storage.period_records(period))
            .await?
            .into_iter()
            .filter(|r| r.source == DataSource::Original)
            .collect();

        for planned in &plan.entries {
            let target = planned.target;
            if existing.contains(&target.location_id) {
                continue;
            }
            match find_fallback(
                target,
                &originals,
                self.reference.as_ref(),
                self.config.max_fallback_radius_km,
            ) {
                Some(record) => {
                    tracing::info!(
                        location_id = %target.location_id,
                        source_location_id = ?record.source_location_id,
                        distance_km = record.distance_km,
                        "fallback record resolved"
                    );
                    persistable(&record)?;
                    state.count_record(&record);
                    buffer.push_record(record).await?;
                }
                None => {
                    tracing::debug!(location_id = %target.location_id, "no fallback within radius");
                    state.summary.fallback_unresolved += 1;
                }
            }
        }

        buffer.flush(state.session_id).await?;
        Ok(())
    }

    /// Flushes pending writes, updates session progress and saves a
    /// checkpoint. The flush comes first so the checkpoint never names a
    /// target whose result is not yet stored.
    async fn save_checkpoint(
        &self,
        state: &mut SessionState,
        buffer: &mut BufferedStorage,
    ) -> Result<(), SessionError> {
        buffer.flush(state.session_id).await?;

        let storage = &self.storage;
        let session_id = state.session_id;
        let progress = state.progress();
        let progress_ref = &progress;
        self.storage_retry()
            .run(move |_| storage.update_session(session_id, progress_ref))
            .await?;

        self.store_checkpoint(&state.checkpoint()).await?;
        state.since_checkpoint = 0;
        tracing::debug!(
            session_id,
            batch_index = state.batch_index,
            processed = progress.processed_count,
            "checkpoint written"
        );
        Ok(())
    }

    /// Best-effort cleanup after an error: flush, checkpoint, mark the
    /// session failed. Targets whose writes could not be flushed are removed
    /// from the checkpoint and the summary so a resumed run redoes them.
    /// Targets whose writes did land are marked processed.
    async fn fail(
        &mut self,
        state: &mut SessionState,
        buffer: &mut BufferedStorage,
        err: &SessionError,
    ) {
        tracing::error!(
            period = %state.period,
            session_id = state.session_id,
            phase = %self.phase,
            error = %err,
            "session failed"
        );
        if self.phase.can_transition_to(SessionPhase::Failed) {
            self.phase = SessionPhase::Failed;
        }

        let pending: Vec<String> = buffer.pending_location_ids().map(str::to_owned).collect();
        match buffer.flush(state.session_id).await {
            Ok(_) => state.processed_ids.extend(pending),
            Err(flush_err) => {
                tracing::warn!(
                    error = %flush_err,
                    unflushed = pending.len(),
                    "pending writes lost; their targets will be redone on resume"
                );
                let still_pending: HashSet<&str> = buffer.pending_location_ids().collect();
                state.processed_ids.extend(
                    pending
                        .into_iter()
                        .filter(|id| !still_pending.contains(id.as_str())),
                );
                state.retract_unflushed(buffer.pending_records(), buffer.pending_errors());
            }
        }

        if let Err(cp_err) = self.store_checkpoint(&state.checkpoint()).await {
            tracing::warn!(error = %cp_err, "failed to save checkpoint for failed session");
        }
        if let Err(fail_err) = self
            .storage
            .fail_session(state.session_id, &err.to_string())
            .await
        {
            tracing::warn!(
                session_id = state.session_id,
                error = %fail_err,
                "failed to mark session as failed"
            );
        }
    }
}
