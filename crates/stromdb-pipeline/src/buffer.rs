//! Write batching and bounded retry at the storage boundary.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use stromdb_core::{
    DataSource, ErrorEntry, PipelineConfig, PriceRecord, SessionId, StorageBackend, StorageError,
};
use stromdb_scraper::retry_with_delay;

/// Retry policy for storage calls. Only [`StorageError::is_transient`]
/// failures are retried.
#[derive(Debug, Clone, Copy)]
pub struct StorageRetry {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl StorageRetry {
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.storage_max_retries,
            delay: Duration::from_millis(config.storage_retry_delay_ms),
        }
    }

    /// Runs `operation` under this policy.
    ///
    /// # Errors
    ///
    /// Returns the last [`StorageError`] once attempts are exhausted or the
    /// error is not transient.
    pub async fn run<T, F, Fut>(&self, operation: F) -> Result<T, StorageError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        retry_with_delay(
            self.max_attempts,
            self.delay,
            StorageError::is_transient,
            operation,
        )
        .await
        .result
    }
}

/// Collects records and error entries and writes them in bulk once a
/// threshold is reached or [`flush`](Self::flush) is called.
///
/// Nothing pushed here is durable until a flush succeeds.
pub struct BufferedStorage {
    backend: Arc<dyn StorageBackend>,
    retry: StorageRetry,
    records: Vec<PriceRecord>,
    errors: Vec<ErrorEntry>,
    result_batch_size: usize,
    error_batch_size: usize,
}

/// Rows written by one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub records: u64,
    pub errors: usize,
}

impl BufferedStorage {
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, config: &PipelineConfig) -> Self {
        Self {
            backend,
            retry: StorageRetry::from_config(config),
            records: Vec::new(),
            errors: Vec::new(),
            result_batch_size: config.result_batch_size.max(1),
            error_batch_size: config.error_batch_size.max(1),
        }
    }

    /// Queues `record`, flushing records when the threshold is reached.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidRecord`] for a record that must not be
    /// stored, or the flush error.
    pub async fn push_record(&mut self, record: PriceRecord) -> Result<(), StorageError> {
        persistable(&record)?;
        self.records.push(record);
        if self.records.len() >= self.result_batch_size {
            self.flush_records().await?;
        }
        Ok(())
    }

    /// Queues `entry` for `session_id`, flushing errors when the threshold
    /// is reached.
    ///
    /// # Errors
    ///
    /// Returns the flush error.
    pub async fn push_error(
        &mut self,
        session_id: SessionId,
        entry: ErrorEntry,
    ) -> Result<(), StorageError> {
        self.errors.push(entry);
        if self.errors.len() >= self.error_batch_size {
            self.flush_errors(session_id).await?;
        }
        Ok(())
    }

    /// Writes everything pending. Buffers are only cleared after a
    /// successful write, so a failed flush can be retried.
    ///
    /// # Errors
    ///
    /// Returns the first [`StorageError`] that survived the retry policy.
    pub async fn flush(&mut self, session_id: SessionId) -> Result<FlushStats, StorageError> {
        let records = self.flush_records().await?;
        let errors = self.flush_errors(session_id).await?;
        if records > 0 || errors > 0 {
            tracing::debug!(records, errors, "write buffer flushed");
        }
        Ok(FlushStats { records, errors })
    }

    async fn flush_records(&mut self) -> Result<u64, StorageError> {
        if self.records.is_empty() {
            return Ok(0);
        }
        let backend = &self.backend;
        let records = &self.records;
        let written = self
            .retry
            .run(move |_| backend.bulk_upsert(records))
            .await?;
        self.records.clear();
        Ok(written)
    }

    async fn flush_errors(&mut self, session_id: SessionId) -> Result<usize, StorageError> {
        if self.errors.is_empty() {
            return Ok(0);
        }
        let backend = &self.backend;
        let errors = &self.errors;
        self.retry
            .run(move |_| backend.log_errors(session_id, errors))
            .await?;
        let count = self.errors.len();
        self.errors.clear();
        Ok(count)
    }

    /// Scraped location ids whose record or error entry has not been written
    /// yet. Fallback records are not included.
    pub fn pending_location_ids(&self) -> impl Iterator<Item = &str> {
        self.records
            .iter()
            .filter(|r| r.source != DataSource::Fallback)
            .map(|r| r.location_id.as_str())
            .chain(self.errors.iter().map(|e| e.location_id.as_str()))
    }

    #[must_use]
    pub fn pending_records(&self) -> &[PriceRecord] {
        &self.records
    }

    #[must_use]
    pub fn pending_errors(&self) -> &[ErrorEntry] {
        &self.errors
    }
}

/// Checks that `record` may be stored at all.
///
/// # Errors
///
/// Returns [`StorageError::InvalidRecord`] naming the violated rule.
pub fn persistable(record: &PriceRecord) -> Result<(), StorageError> {
    record
        .ensure_persistable()
        .map_err(|e| StorageError::InvalidRecord {
            location_id: record.location_id.clone(),
            reason: e.to_string(),
        })
}
