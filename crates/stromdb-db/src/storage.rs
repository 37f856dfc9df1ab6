//! [`StorageBackend`] over a Postgres pool.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::PgPool;
use stromdb_core::{
    ErrorEntry, Period, PriceRecord, SessionId, SessionProgress, StorageBackend, StorageError,
};

use crate::{price_records, scrape_errors, scrape_sessions, DbError};

#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Connection-level failures are transient; anything the server answered
/// with is not.
fn storage_error(err: DbError) -> StorageError {
    match err {
        DbError::InvalidSessionTransition {
            id,
            expected_status,
        } => StorageError::InvalidSessionTransition {
            id,
            expected_status,
        },
        DbError::InvalidRow {
            location_id,
            reason,
        } => StorageError::InvalidRecord {
            location_id,
            reason,
        },
        DbError::Sqlx(
            e @ (sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed),
        ) => StorageError::Unavailable(e.to_string()),
        other => StorageError::Rejected(other.to_string()),
    }
}

#[async_trait]
impl StorageBackend for PgStorage {
    async fn record_exists(
        &self,
        period: Period,
        location_id: &str,
    ) -> Result<bool, StorageError> {
        price_records::price_record_exists(&self.pool, period, location_id)
            .await
            .map_err(storage_error)
    }

    async fn bulk_existing_ids(&self, period: Period) -> Result<HashSet<String>, StorageError> {
        price_records::list_existing_location_ids(&self.pool, period)
            .await
            .map_err(storage_error)
    }

    async fn upsert_record(&self, record: &PriceRecord) -> Result<(), StorageError> {
        price_records::upsert_price_record(&self.pool, record)
            .await
            .map_err(storage_error)
    }

    async fn bulk_upsert(&self, records: &[PriceRecord]) -> Result<u64, StorageError> {
        price_records::bulk_upsert_price_records(&self.pool, records)
            .await
            .map_err(storage_error)
    }

    async fn period_records(&self, period: Period) -> Result<Vec<PriceRecord>, StorageError> {
        price_records::list_period_price_records(&self.pool, period)
            .await
            .map_err(storage_error)?
            .into_iter()
            .map(|row| row.into_record().map_err(storage_error))
            .collect()
    }

    async fn start_session(
        &self,
        period: Period,
        total_targets: usize,
        config_snapshot: &serde_json::Value,
    ) -> Result<SessionId, StorageError> {
        scrape_sessions::create_scrape_session(&self.pool, period, total_targets, config_snapshot)
            .await
            .map_err(storage_error)
    }

    async fn resume_session(&self, id: SessionId) -> Result<(), StorageError> {
        scrape_sessions::resume_scrape_session(&self.pool, id)
            .await
            .map_err(storage_error)
    }

    async fn update_session(
        &self,
        id: SessionId,
        progress: &SessionProgress,
    ) -> Result<(), StorageError> {
        scrape_sessions::update_scrape_session_progress(&self.pool, id, progress)
            .await
            .map_err(storage_error)
    }

    async fn complete_session(
        &self,
        id: SessionId,
        summary: &serde_json::Value,
    ) -> Result<(), StorageError> {
        scrape_sessions::complete_scrape_session(&self.pool, id, summary)
            .await
            .map_err(storage_error)
    }

    async fn fail_session(&self, id: SessionId, error_message: &str) -> Result<(), StorageError> {
        scrape_sessions::fail_scrape_session(&self.pool, id, error_message)
            .await
            .map_err(storage_error)
    }

    async fn log_error(&self, id: SessionId, entry: &ErrorEntry) -> Result<(), StorageError> {
        self.log_errors(id, std::slice::from_ref(entry)).await
    }

    async fn log_errors(&self, id: SessionId, entries: &[ErrorEntry]) -> Result<(), StorageError> {
        scrape_errors::insert_scrape_errors(&self.pool, id, entries)
            .await
            .map(|_| ())
            .map_err(storage_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeouts_are_transient() {
        let err = storage_error(DbError::Sqlx(sqlx::Error::PoolTimedOut));
        assert!(err.is_transient(), "got: {err:?}");
    }

    #[test]
    fn missing_rows_are_not_transient() {
        let err = storage_error(DbError::Sqlx(sqlx::Error::RowNotFound));
        assert!(matches!(err, StorageError::Rejected(_)), "got: {err:?}");
        assert!(!err.is_transient());
    }

    #[test]
    fn session_transitions_keep_their_shape() {
        let err = storage_error(DbError::InvalidSessionTransition {
            id: 4,
            expected_status: "running",
        });
        assert!(matches!(
            err,
            StorageError::InvalidSessionTransition {
                id: 4,
                expected_status: "running"
            }
        ));
    }
}
