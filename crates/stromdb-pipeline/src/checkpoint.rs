//! Resumable run state, persisted as one JSON file per period.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stromdb_core::{Period, SessionId};
use thiserror::Error;

use crate::session::RunSummary;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint at {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

impl CheckpointError {
    /// I/O failures and an unavailable store may clear up on retry. A corrupt
    /// or unserializable checkpoint will not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Unavailable(_))
    }
}

/// Snapshot of a run between targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: SessionId,
    pub period: Period,
    /// Batch to resume at.
    pub batch_index: usize,
    pub total_batches: usize,
    pub total_targets: usize,
    pub processed_ids: BTreeSet<String>,
    pub started_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
    pub accumulated_result_count: usize,
    pub accumulated_error_count: usize,
    #[serde(default)]
    pub summary: RunSummary,
}

impl Checkpoint {
    /// A checkpoint only applies to a run over the same number of targets
    /// split into the same number of batches.
    #[must_use]
    pub fn is_compatible(&self, total_targets: usize, total_batches: usize) -> bool {
        self.total_targets == total_targets && self.total_batches == total_batches
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, period: Period) -> Result<Option<Checkpoint>, CheckpointError>;

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Removes the checkpoint for `period`. Missing checkpoints are not an error.
    async fn clear(&self, period: Period) -> Result<(), CheckpointError>;
}

/// Stores `checkpoint_<period>.json` files in one directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn path_for(&self, period: Period) -> PathBuf {
        self.dir.join(format!("checkpoint_{period}.json"))
    }

    fn io_error(path: &Path, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, period: Period) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(period);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_error(&path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| CheckpointError::Corrupt { path, source })
    }

    /// Writes to a sibling temp file and renames it over the target, so a
    /// crash mid-write leaves the previous checkpoint intact.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::io_error(&self.dir, e))?;

        let path = self.path_for(checkpoint.period);
        let tmp = self.dir.join(format!(
            "checkpoint_{}.json.{}.tmp",
            checkpoint.period,
            uuid::Uuid::new_v4().simple()
        ));
        let body = serde_json::to_vec_pretty(checkpoint)?;

        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| Self::io_error(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Self::io_error(&path, e));
        }

        tracing::debug!(
            path = %path.display(),
            batch_index = checkpoint.batch_index,
            processed = checkpoint.processed_ids.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    async fn clear(&self, period: Period) -> Result<(), CheckpointError> {
        let path = self.path_for(period);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }
}

/// In-process [`CheckpointStore`] for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<Period, Checkpoint>>,
    saves: AtomicUsize,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls so far.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Current checkpoint for `period`, if any.
    #[must_use]
    pub fn get(&self, period: Period) -> Option<Checkpoint> {
        self.checkpoints
            .lock()
            .ok()
            .and_then(|map| map.get(&period).cloned())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Period, Checkpoint>>, CheckpointError> {
        self.checkpoints
            .lock()
            .map_err(|_| CheckpointError::Unavailable("checkpoint map lock poisoned".to_owned()))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, period: Period) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.lock()?.get(&period).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.lock()?.insert(checkpoint.period, checkpoint.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self, period: Period) -> Result<(), CheckpointError> {
        self.lock()?.remove(&period);
        Ok(())
    }
}
