//! Persistence contract consumed by the session controller.
//!
//! Record writes are upserts keyed on `(period, location_id)`, so replaying a
//! write after a crash is always safe.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ErrorEntry, Period, PriceRecord};

/// Identifier of a scrape session row.
pub type SessionId = i64;

/// Progress counters written to the session row as a run advances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProgress {
    pub batch_index: usize,
    pub total_batches: usize,
    pub processed_count: usize,
    pub result_count: usize,
    pub error_count: usize,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("record for {location_id} rejected: {reason}")]
    InvalidRecord { location_id: String, reason: String },

    #[error("session {id} is not in expected status '{expected_status}'")]
    InvalidSessionTransition {
        id: SessionId,
        expected_status: &'static str,
    },

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    /// The backend answered but refused the operation (constraint violation,
    /// undecodable row). Retrying will not help.
    #[error("storage backend rejected the operation: {0}")]
    Rejected(String),
}

impl StorageError {
    /// Returns `true` for failures that may succeed when retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn record_exists(&self, period: Period, location_id: &str)
        -> Result<bool, StorageError>;

    /// Every `location_id` with a stored record for `period`, in one query.
    async fn bulk_existing_ids(&self, period: Period) -> Result<HashSet<String>, StorageError>;

    async fn upsert_record(&self, record: &PriceRecord) -> Result<(), StorageError>;

    /// Upserts all `records`, returning how many rows were written.
    async fn bulk_upsert(&self, records: &[PriceRecord]) -> Result<u64, StorageError>;

    /// All stored records of `period`, used as the fallback candidate pool.
    async fn period_records(&self, period: Period) -> Result<Vec<PriceRecord>, StorageError>;

    async fn start_session(
        &self,
        period: Period,
        total_targets: usize,
        config_snapshot: &serde_json::Value,
    ) -> Result<SessionId, StorageError>;

    /// Reopens a session found in a checkpoint. Valid while the session is
    /// `running` (a paused run) or `failed` (a run that crashed on storage).
    async fn resume_session(&self, id: SessionId) -> Result<(), StorageError>;

    async fn update_session(
        &self,
        id: SessionId,
        progress: &SessionProgress,
    ) -> Result<(), StorageError>;

    async fn complete_session(
        &self,
        id: SessionId,
        summary: &serde_json::Value,
    ) -> Result<(), StorageError>;

    async fn fail_session(&self, id: SessionId, error_message: &str) -> Result<(), StorageError>;

    async fn log_error(&self, id: SessionId, entry: &ErrorEntry) -> Result<(), StorageError>;

    async fn log_errors(&self, id: SessionId, entries: &[ErrorEntry]) -> Result<(), StorageError> {
        for entry in entries {
            self.log_error(id, entry).await?;
        }
        Ok(())
    }
}
