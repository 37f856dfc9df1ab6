pub mod app_config;
pub mod config;
pub mod model;
pub mod reference;
pub mod storage;
pub mod targets;

use thiserror::Error;

pub use app_config::{
    AppConfig, DuplicateMode, Environment, OutlierThresholds, PipelineConfig, PriceBand,
};
pub use config::{load_app_config, load_app_config_from_env};
pub use model::{
    average_price, normalize_name, Coordinates, DataSource, ErrorCategory, ErrorEntry,
    ExtractionMethod, OutlierAssessment, OutlierSeverity, Period, PriceRecord, Strategy,
    StrategyTier, Target,
};
pub use reference::{ReferenceData, ReferenceEntry, ReferenceTable};
pub use storage::{SessionId, SessionProgress, StorageBackend, StorageError};
pub use targets::{load_targets, parse_targets, TargetConfig, TargetsFile};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid period \"{0}\": expected YYYY-MM")]
    InvalidPeriod(String),
    #[error("record for {location_id} is not persistable: {reason}")]
    InvalidRecord { location_id: String, reason: String },
    #[error("unknown {kind} \"{value}\"")]
    UnknownValue { kind: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },
    #[error("failed to read targets file {path}: {source}")]
    TargetsFileIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse targets file: {0}")]
    TargetsFileParse(#[from] serde_yaml::Error),
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
