use std::path::PathBuf;
use std::str::FromStr;

use crate::app_config::{
    AppConfig, DuplicateMode, Environment, OutlierThresholds, PipelineConfig, PriceBand,
};
use crate::ConfigError;

/// Load application configuration from environment variables.
///
/// Calls `dotenvy::dotenv().ok()` to load `.env` files before reading env vars.
///
/// # Errors
///
/// Returns `ConfigError` if required env vars are missing or values are invalid.
pub fn load_app_config() -> Result<AppConfig, ConfigError> {
    dotenvy::dotenv().ok();
    load_app_config_from_env()
}

/// Load application configuration from environment variables already in the process.
///
/// Unlike [`load_app_config`], this does NOT load `.env` files.
///
/// # Errors
///
/// Returns `ConfigError` if required env vars are missing or values are invalid.
pub fn load_app_config_from_env() -> Result<AppConfig, ConfigError> {
    build_app_config(|key| std::env::var(key))
}

/// Parse `var` with `FromStr`, falling back to `default` when unset.
fn parse_or<T, F>(lookup: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    match lookup(var) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidEnvVar {
            var: var.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_bool_or<F>(lookup: &F, var: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let Ok(raw) = lookup(var) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidEnvVar {
            var: var.to_string(),
            reason: format!("expected a boolean, got \"{other}\""),
        }),
    }
}

/// Build application configuration using the provided env-var lookup function.
///
/// Decoupled from the real environment so it can be tested with a pure
/// `HashMap` lookup.
fn build_app_config<F>(lookup: F) -> Result<AppConfig, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let require = |var: &str| -> Result<String, ConfigError> {
        lookup(var).map_err(|_| ConfigError::MissingEnvVar(var.to_string()))
    };

    let or_default = |var: &str, default: &str| -> String {
        lookup(var).unwrap_or_else(|_| default.to_string())
    };

    let database_url = require("DATABASE_URL")?;
    let env = parse_environment(&or_default("STROMDB_ENV", "development"))?;
    let log_level = or_default("STROMDB_LOG_LEVEL", "info");
    let targets_path = PathBuf::from(or_default("STROMDB_TARGETS_PATH", "./config/targets.yaml"));
    let checkpoint_dir = PathBuf::from(or_default("STROMDB_CHECKPOINT_DIR", "./checkpoints"));
    let source_url_template = or_default(
        "STROMDB_SOURCE_URL_TEMPLATE",
        "https://www.strompreise-vergleich.de/strompreise/{name}",
    );
    if !source_url_template.contains("{name}") && !source_url_template.contains("{id}") {
        return Err(ConfigError::InvalidEnvVar {
            var: "STROMDB_SOURCE_URL_TEMPLATE".to_string(),
            reason: "template must contain {name} or {id}".to_string(),
        });
    }

    let db_max_connections = parse_or(&lookup, "STROMDB_DB_MAX_CONNECTIONS", 5u32)?;
    let db_min_connections = parse_or(&lookup, "STROMDB_DB_MIN_CONNECTIONS", 1u32)?;
    let db_acquire_timeout_secs = parse_or(&lookup, "STROMDB_DB_ACQUIRE_TIMEOUT_SECS", 10u64)?;

    let scraper_request_timeout_secs =
        parse_or(&lookup, "STROMDB_SCRAPER_REQUEST_TIMEOUT_SECS", 30u64)?;
    let scraper_user_agent = or_default("STROMDB_SCRAPER_USER_AGENT", "stromdb/0.1 (price-survey)");

    let defaults = PipelineConfig::default();
    let pipeline = PipelineConfig {
        inter_request_delay_ms: parse_or(
            &lookup,
            "STROMDB_INTER_REQUEST_DELAY_MS",
            defaults.inter_request_delay_ms,
        )?,
        inter_batch_pause_ms: parse_or(
            &lookup,
            "STROMDB_INTER_BATCH_PAUSE_MS",
            defaults.inter_batch_pause_ms,
        )?,
        max_retries: parse_or(&lookup, "STROMDB_MAX_RETRIES", defaults.max_retries)?,
        retry_delay_ms: parse_or(&lookup, "STROMDB_RETRY_DELAY_MS", defaults.retry_delay_ms)?,
        batch_count: parse_or(&lookup, "STROMDB_BATCH_COUNT", defaults.batch_count)?,
        checkpoint_interval: parse_or(
            &lookup,
            "STROMDB_CHECKPOINT_INTERVAL",
            defaults.checkpoint_interval,
        )?,
        auto_progress: parse_bool_or(&lookup, "STROMDB_AUTO_PROGRESS", defaults.auto_progress)?,
        fallback_enabled: parse_bool_or(
            &lookup,
            "STROMDB_FALLBACK_ENABLED",
            defaults.fallback_enabled,
        )?,
        duplicate_mode: parse_or::<DuplicateMode, _>(
            &lookup,
            "STROMDB_DUPLICATE_MODE",
            defaults.duplicate_mode,
        )?,
        result_batch_size: parse_or(
            &lookup,
            "STROMDB_RESULT_BATCH_SIZE",
            defaults.result_batch_size,
        )?,
        error_batch_size: parse_or(&lookup, "STROMDB_ERROR_BATCH_SIZE", defaults.error_batch_size)?,
        storage_max_retries: parse_or(
            &lookup,
            "STROMDB_STORAGE_MAX_RETRIES",
            defaults.storage_max_retries,
        )?,
        storage_retry_delay_ms: parse_or(
            &lookup,
            "STROMDB_STORAGE_RETRY_DELAY_MS",
            defaults.storage_retry_delay_ms,
        )?,
        max_fallback_radius_km: parse_or(
            &lookup,
            "STROMDB_MAX_FALLBACK_RADIUS_KM",
            defaults.max_fallback_radius_km,
        )?,
        price_band: PriceBand {
            min: parse_or(&lookup, "STROMDB_PRICE_MIN", defaults.price_band.min)?,
            max: parse_or(&lookup, "STROMDB_PRICE_MAX", defaults.price_band.max)?,
        },
        outlier_thresholds: OutlierThresholds {
            high: parse_or(
                &lookup,
                "STROMDB_OUTLIER_HIGH",
                defaults.outlier_thresholds.high,
            )?,
            very_high: parse_or(
                &lookup,
                "STROMDB_OUTLIER_VERY_HIGH",
                defaults.outlier_thresholds.very_high,
            )?,
            extreme: parse_or(
                &lookup,
                "STROMDB_OUTLIER_EXTREME",
                defaults.outlier_thresholds.extreme,
            )?,
        },
    };
    pipeline.validate()?;

    Ok(AppConfig {
        database_url,
        env,
        log_level,
        targets_path,
        checkpoint_dir,
        source_url_template,
        db_max_connections,
        db_min_connections,
        db_acquire_timeout_secs,
        scraper_request_timeout_secs,
        scraper_user_agent,
        pipeline,
    })
}

/// Parse a string into an `Environment` variant.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidEnvVar`] for unrecognized values.
fn parse_environment(s: &str) -> Result<Environment, ConfigError> {
    match s {
        "development" => Ok(Environment::Development),
        "test" => Ok(Environment::Test),
        "production" => Ok(Environment::Production),
        other => Err(ConfigError::InvalidEnvVar {
            var: "STROMDB_ENV".to_string(),
            reason: format!("unknown environment \"{other}\""),
        }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
