use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use stromdb_core::{
    DataSource, ErrorCategory, ErrorEntry, Period, PriceRecord, SessionId, SessionProgress,
};

use super::RunSummary;
use crate::checkpoint::Checkpoint;

/// All mutable state of a run. Owned by the controller and passed by
/// `&mut` to every step.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: SessionId,
    pub period: Period,
    pub batch_index: usize,
    pub total_batches: usize,
    pub total_targets: usize,
    pub processed_ids: BTreeSet<String>,
    pub accumulated_result_count: usize,
    pub accumulated_error_count: usize,
    pub started_at: DateTime<Utc>,
    pub config_snapshot: serde_json::Value,
    pub summary: RunSummary,
    /// Targets processed since the last checkpoint.
    pub(crate) since_checkpoint: usize,
}

impl SessionState {
    #[must_use]
    pub fn fresh(
        session_id: SessionId,
        period: Period,
        total_batches: usize,
        total_targets: usize,
        config_snapshot: serde_json::Value,
    ) -> Self {
        Self {
            session_id,
            period,
            batch_index: 0,
            total_batches,
            total_targets,
            processed_ids: BTreeSet::new(),
            accumulated_result_count: 0,
            accumulated_error_count: 0,
            started_at: Utc::now(),
            config_snapshot,
            summary: RunSummary::default(),
            since_checkpoint: 0,
        }
    }

    #[must_use]
    pub fn from_checkpoint(checkpoint: Checkpoint, config_snapshot: serde_json::Value) -> Self {
        Self {
            session_id: checkpoint.session_id,
            period: checkpoint.period,
            batch_index: checkpoint.batch_index,
            total_batches: checkpoint.total_batches,
            total_targets: checkpoint.total_targets,
            processed_ids: checkpoint.processed_ids,
            accumulated_result_count: checkpoint.accumulated_result_count,
            accumulated_error_count: checkpoint.accumulated_error_count,
            started_at: checkpoint.started_at,
            config_snapshot,
            summary: checkpoint.summary,
            since_checkpoint: 0,
        }
    }

    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            session_id: self.session_id,
            period: self.period,
            batch_index: self.batch_index,
            total_batches: self.total_batches,
            total_targets: self.total_targets,
            processed_ids: self.processed_ids.clone(),
            started_at: self.started_at,
            saved_at: Utc::now(),
            accumulated_result_count: self.accumulated_result_count,
            accumulated_error_count: self.accumulated_error_count,
            summary: self.summary.clone(),
        }
    }

    #[must_use]
    pub fn progress(&self) -> SessionProgress {
        SessionProgress {
            batch_index: self.batch_index,
            total_batches: self.total_batches,
            processed_count: self.processed_ids.len(),
            result_count: self.accumulated_result_count,
            error_count: self.accumulated_error_count,
        }
    }

    /// Counts a record about to be queued for writing.
    pub(crate) fn count_record(&mut self, record: &PriceRecord) {
        if record.source == DataSource::Fallback {
            self.summary.fallback_persisted += 1;
            return;
        }
        self.summary.persisted += 1;
        self.accumulated_result_count += 1;
        if record.outlier.has_outlier {
            self.summary.record_outlier(record.outlier.severity);
        }
    }

    /// Counts an error entry about to be queued for writing.
    pub(crate) fn count_error(&mut self, category: ErrorCategory) {
        self.summary.record_error(category);
        self.accumulated_error_count += 1;
    }

    /// Undoes the counting and the processed marks of writes that never
    /// reached storage, so a resumed run redoes those targets exactly once.
    pub(crate) fn retract_unflushed(&mut self, records: &[PriceRecord], errors: &[ErrorEntry]) {
        for record in records {
            if record.source == DataSource::Fallback {
                self.summary.fallback_persisted = self.summary.fallback_persisted.saturating_sub(1);
                continue;
            }
            self.processed_ids.remove(&record.location_id);
            self.summary.fetched = self.summary.fetched.saturating_sub(1);
            self.summary.persisted = self.summary.persisted.saturating_sub(1);
            self.accumulated_result_count = self.accumulated_result_count.saturating_sub(1);
            if record.outlier.has_outlier {
                self.summary.retract_outlier(record.outlier.severity);
            }
        }
        for entry in errors {
            self.processed_ids.remove(&entry.location_id);
            self.summary.fetched = self.summary.fetched.saturating_sub(1);
            self.summary.retract_error(entry.category);
            self.accumulated_error_count = self.accumulated_error_count.saturating_sub(1);
        }
    }

    /// Marks `location_id` done and reports whether a checkpoint is due.
    pub(crate) fn mark_processed(&mut self, location_id: &str, checkpoint_interval: usize) -> bool {
        self.processed_ids.insert(location_id.to_owned());
        self.since_checkpoint += 1;
        self.since_checkpoint >= checkpoint_interval
    }
}
