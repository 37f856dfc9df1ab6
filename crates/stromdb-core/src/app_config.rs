use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// How targets that already have a record for the period are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateMode {
    /// Bulk-load existing ids once and never fetch those targets.
    #[default]
    Skip,
    /// Fetch everything; upserts replace existing rows.
    Overwrite,
}

impl FromStr for DuplicateMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(DuplicateMode::Skip),
            "overwrite" => Ok(DuplicateMode::Overwrite),
            other => Err(format!("expected \"skip\" or \"overwrite\", got \"{other}\"")),
        }
    }
}

/// Inclusive plausibility band for a per-kWh price, in EUR.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBand {
    pub min: f64,
    pub max: f64,
}

impl PriceBand {
    #[must_use]
    pub fn contains(&self, price: f64) -> bool {
        price.is_finite() && price >= self.min && price <= self.max
    }
}

impl Default for PriceBand {
    fn default() -> Self {
        Self {
            min: 0.05,
            max: 2.0,
        }
    }
}

/// Ascending per-kWh thresholds for outlier severities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutlierThresholds {
    pub high: f64,
    pub very_high: f64,
    pub extreme: f64,
}

impl Default for OutlierThresholds {
    fn default() -> Self {
        Self {
            high: 0.80,
            very_high: 1.20,
            extreme: 1.50,
        }
    }
}

/// Everything the session controller and its collaborators need. Contains no
/// secrets, so it is stored verbatim as the session's config snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub inter_request_delay_ms: u64,
    pub inter_batch_pause_ms: u64,
    /// Total attempts per target, including the first.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub batch_count: usize,
    /// Processed targets between two checkpoints.
    pub checkpoint_interval: usize,
    pub auto_progress: bool,
    pub fallback_enabled: bool,
    pub duplicate_mode: DuplicateMode,
    pub result_batch_size: usize,
    pub error_batch_size: usize,
    pub storage_max_retries: u32,
    pub storage_retry_delay_ms: u64,
    pub max_fallback_radius_km: f64,
    pub price_band: PriceBand,
    pub outlier_thresholds: OutlierThresholds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inter_request_delay_ms: 2_000,
            inter_batch_pause_ms: 60_000,
            max_retries: 3,
            retry_delay_ms: 5_000,
            batch_count: 10,
            checkpoint_interval: 25,
            auto_progress: false,
            fallback_enabled: true,
            duplicate_mode: DuplicateMode::Skip,
            result_batch_size: 50,
            error_batch_size: 20,
            storage_max_retries: 3,
            storage_retry_delay_ms: 1_000,
            max_fallback_radius_km: 50.0,
            price_band: PriceBand::default(),
            outlier_thresholds: OutlierThresholds::default(),
        }
    }
}

impl PipelineConfig {
    /// Checks cross-field constraints that individual parsers cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Validation(msg));

        if !(self.price_band.min > 0.0 && self.price_band.min < self.price_band.max) {
            return fail(format!(
                "price band must satisfy 0 < min < max (got {} .. {})",
                self.price_band.min, self.price_band.max
            ));
        }
        let t = &self.outlier_thresholds;
        if !(t.high > 0.0 && t.high < t.very_high && t.very_high < t.extreme) {
            return fail(format!(
                "outlier thresholds must be strictly ascending (got {} / {} / {})",
                t.high, t.very_high, t.extreme
            ));
        }
        if self.batch_count == 0 {
            return fail("batch count must be at least 1".to_string());
        }
        if self.checkpoint_interval == 0 {
            return fail("checkpoint interval must be at least 1".to_string());
        }
        if self.max_retries == 0 {
            return fail("max retries must allow at least one attempt".to_string());
        }
        if !(self.max_fallback_radius_km.is_finite() && self.max_fallback_radius_km > 0.0) {
            return fail(format!(
                "max fallback radius must be positive (got {})",
                self.max_fallback_radius_km
            ));
        }
        if self.result_batch_size == 0 || self.error_batch_size == 0 {
            return fail("write-batching thresholds must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub env: Environment,
    pub log_level: String,
    pub targets_path: PathBuf,
    pub checkpoint_dir: PathBuf,
    /// Page address template with `{name}` and `{id}` placeholders.
    pub source_url_template: String,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub scraper_request_timeout_secs: u64,
    pub scraper_user_agent: String,
    pub pipeline: PipelineConfig,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("env", &self.env)
            .field("log_level", &self.log_level)
            .field("targets_path", &self.targets_path)
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("source_url_template", &self.source_url_template)
            .field("database_url", &"[redacted]")
            .field("db_max_connections", &self.db_max_connections)
            .field("db_min_connections", &self.db_min_connections)
            .field("db_acquire_timeout_secs", &self.db_acquire_timeout_secs)
            .field(
                "scraper_request_timeout_secs",
                &self.scraper_request_timeout_secs,
            )
            .field("scraper_user_agent", &self.scraper_user_agent)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}
