//! Quality checks, geographic fallback and the resumable session controller
//! that ties fetching, extraction and storage together.

pub mod buffer;
pub mod checkpoint;
pub mod fallback;
pub mod memory;
pub mod quality;
pub mod session;

pub use buffer::{BufferedStorage, FlushStats, StorageRetry};
pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
pub use fallback::{find_fallback, haversine_km};
pub use memory::{MemorySession, MemorySessionStatus, MemoryStorage};
pub use quality::{assess_outliers, price_severity, validate_record, RecordValidation};
pub use session::{
    RunOutcome, RunSummary, SessionController, SessionError, SessionPhase, SessionState,
};
