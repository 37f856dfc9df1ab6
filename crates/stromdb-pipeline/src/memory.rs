//! In-process [`StorageBackend`] used for dry runs and tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use stromdb_core::{
    ErrorEntry, Period, PriceRecord, SessionId, SessionProgress, StorageBackend, StorageError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySessionStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct MemorySession {
    pub period: Period,
    pub status: MemorySessionStatus,
    pub total_targets: usize,
    pub progress: SessionProgress,
    pub config_snapshot: serde_json::Value,
    pub summary: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<(Period, String), PriceRecord>,
    sessions: HashMap<SessionId, MemorySession>,
    errors: Vec<(SessionId, ErrorEntry)>,
    next_session_id: SessionId,
}

/// Keeps everything in a `HashMap` keyed like the database tables.
/// [`set_unavailable`](Self::set_unavailable) makes record and error writes
/// fail with a transient error; [`fail_next_writes`](Self::fail_next_writes)
/// does so for a fixed number of calls.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
    failing_writes: AtomicUsize,
    upsert_calls: AtomicUsize,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes the next `count` record or error writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of `upsert_record` / `bulk_upsert` calls that reached the map.
    #[must_use]
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    /// Stored records of `period`, ordered by location id.
    #[must_use]
    pub fn records(&self, period: Period) -> Vec<PriceRecord> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let mut records: Vec<PriceRecord> = inner
            .records
            .values()
            .filter(|r| r.period == period)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.location_id.cmp(&b.location_id));
        records
    }

    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<MemorySession> {
        self.inner.lock().ok()?.sessions.get(&id).cloned()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.sessions.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn errors(&self, id: SessionId) -> Vec<ErrorEntry> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .errors
                    .iter()
                    .filter(|(sid, _)| *sid == id)
                    .map(|(_, e)| e.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Unavailable("memory storage lock poisoned".to_owned()))
    }

    fn check_available(&self) -> Result<(), StorageError> {
        let scripted_failure = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure || self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable(
                "memory storage marked unavailable".to_owned(),
            ))
        } else {
            Ok(())
        }
    }

    fn insert(inner: &mut Inner, record: &PriceRecord) -> Result<(), StorageError> {
        record
            .ensure_persistable()
            .map_err(|e| StorageError::InvalidRecord {
                location_id: record.location_id.clone(),
                reason: e.to_string(),
            })?;
        inner.records.insert(
            (record.period, record.location_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    fn transition(
        &self,
        id: SessionId,
        expected: &[MemorySessionStatus],
        expected_status: &'static str,
        apply: impl FnOnce(&mut MemorySession),
    ) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or(StorageError::SessionNotFound(id))?;
        if !expected.contains(&session.status) {
            return Err(StorageError::InvalidSessionTransition {
                id,
                expected_status,
            });
        }
        apply(session);
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn record_exists(&self, period: Period, location_id: &str) -> Result<bool, StorageError> {
        Ok(self
            .lock()?
            .records
            .contains_key(&(period, location_id.to_owned())))
    }

    async fn bulk_existing_ids(&self, period: Period) -> Result<HashSet<String>, StorageError> {
        Ok(self
            .lock()?
            .records
            .keys()
            .filter(|(p, _)| *p == period)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn upsert_record(&self, record: &PriceRecord) -> Result<(), StorageError> {
        self.check_available()?;
        let mut inner = self.lock()?;
        Self::insert(&mut inner, record)?;
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn bulk_upsert(&self, records: &[PriceRecord]) -> Result<u64, StorageError> {
        self.check_available()?;
        let mut inner = self.lock()?;
        for record in records {
            Self::insert(&mut inner, record)?;
        }
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        Ok(u64::try_from(records.len()).unwrap_or(u64::MAX))
    }

    async fn period_records(&self, period: Period) -> Result<Vec<PriceRecord>, StorageError> {
        Ok(self.records(period))
    }

    async fn start_session(
        &self,
        period: Period,
        total_targets: usize,
        config_snapshot: &serde_json::Value,
    ) -> Result<SessionId, StorageError> {
        let mut inner = self.lock()?;
        inner.next_session_id += 1;
        let id = inner.next_session_id;
        inner.sessions.insert(
            id,
            MemorySession {
                period,
                status: MemorySessionStatus::Running,
                total_targets,
                progress: SessionProgress::default(),
                config_snapshot: config_snapshot.clone(),
                summary: None,
                error_message: None,
            },
        );
        Ok(id)
    }

    async fn resume_session(&self, id: SessionId) -> Result<(), StorageError> {
        self.transition(
            id,
            &[MemorySessionStatus::Running, MemorySessionStatus::Failed],
            "running|failed",
            |s| {
                s.status = MemorySessionStatus::Running;
                s.error_message = None;
            },
        )
    }

    async fn update_session(
        &self,
        id: SessionId,
        progress: &SessionProgress,
    ) -> Result<(), StorageError> {
        self.transition(id, &[MemorySessionStatus::Running], "running", |s| {
            s.progress = *progress;
        })
    }

    async fn complete_session(
        &self,
        id: SessionId,
        summary: &serde_json::Value,
    ) -> Result<(), StorageError> {
        self.transition(id, &[MemorySessionStatus::Running], "running", |s| {
            s.status = MemorySessionStatus::Completed;
            s.summary = Some(summary.clone());
        })
    }

    async fn fail_session(&self, id: SessionId, error_message: &str) -> Result<(), StorageError> {
        self.transition(id, &[MemorySessionStatus::Running], "running", |s| {
            s.status = MemorySessionStatus::Failed;
            s.error_message = Some(error_message.to_owned());
        })
    }

    async fn log_error(&self, id: SessionId, entry: &ErrorEntry) -> Result<(), StorageError> {
        self.check_available()?;
        self.lock()?.errors.push((id, entry.clone()));
        Ok(())
    }

    async fn log_errors(&self, id: SessionId, entries: &[ErrorEntry]) -> Result<(), StorageError> {
        self.check_available()?;
        self.lock()?
            .errors
            .extend(entries.iter().map(|e| (id, e.clone())));
        Ok(())
    }
}
