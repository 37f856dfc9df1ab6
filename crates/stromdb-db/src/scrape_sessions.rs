//! Database operations for `scrape_sessions`.
//!
//! Status transitions are guarded in SQL: each update names the status it
//! expects and reports [`DbError::InvalidSessionTransition`] when no row
//! matched.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use stromdb_core::{Period, SessionId, SessionProgress};
use uuid::Uuid;

use crate::{to_i32, DbError};

/// A row from the `scrape_sessions` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScrapeSessionRow {
    pub id: i64,
    pub public_id: Uuid,
    pub period: String,
    /// `running`, `completed` or `failed`.
    pub status: String,
    pub total_targets: i32,
    pub batch_index: i32,
    pub total_batches: i32,
    pub processed_count: i32,
    pub result_count: i32,
    pub error_count: i32,
    pub config_snapshot: serde_json::Value,
    pub summary: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

const SESSION_COLUMNS: &str = "id, public_id, period, status, total_targets, batch_index, \
     total_batches, processed_count, result_count, error_count, config_snapshot, summary, \
     error_message, started_at, updated_at, completed_at";

/// Creates a session in `running` status and returns its `id`.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the insert fails.
pub async fn create_scrape_session(
    pool: &PgPool,
    period: Period,
    total_targets: usize,
    config_snapshot: &serde_json::Value,
) -> Result<SessionId, DbError> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO scrape_sessions (public_id, period, status, total_targets, config_snapshot) \
         VALUES ($1, $2, 'running', $3, $4) \
         RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind(period.to_string())
    .bind(to_i32(total_targets))
    .bind(config_snapshot)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// Moves a `running` or `failed` session (back) to `running` and clears
/// any previous error.
///
/// # Errors
///
/// Returns [`DbError::InvalidSessionTransition`] if the session is missing
/// or already completed, or [`DbError::Sqlx`] if the update fails.
pub async fn resume_scrape_session(pool: &PgPool, id: SessionId) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE scrape_sessions \
         SET status = 'running', error_message = NULL, completed_at = NULL, updated_at = NOW() \
         WHERE id = $1 AND status IN ('running', 'failed')",
    )
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::InvalidSessionTransition {
            id,
            expected_status: "running|failed",
        });
    }

    Ok(())
}

/// Writes progress counters to a `running` session.
///
/// # Errors
///
/// Returns [`DbError::InvalidSessionTransition`] if the session is not
/// `running`, or [`DbError::Sqlx`] if the update fails.
pub async fn update_scrape_session_progress(
    pool: &PgPool,
    id: SessionId,
    progress: &SessionProgress,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE scrape_sessions \
         SET batch_index = $1, total_batches = $2, processed_count = $3, \
             result_count = $4, error_count = $5, updated_at = NOW() \
         WHERE id = $6 AND status = 'running'",
    )
    .bind(to_i32(progress.batch_index))
    .bind(to_i32(progress.total_batches))
    .bind(to_i32(progress.processed_count))
    .bind(to_i32(progress.result_count))
    .bind(to_i32(progress.error_count))
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::InvalidSessionTransition {
            id,
            expected_status: "running",
        });
    }

    Ok(())
}

/// Marks a session `completed` and stores the run summary.
///
/// # Errors
///
/// Returns [`DbError::InvalidSessionTransition`] if the session is not
/// `running`, or [`DbError::Sqlx`] if the update fails.
pub async fn complete_scrape_session(
    pool: &PgPool,
    id: SessionId,
    summary: &serde_json::Value,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE scrape_sessions \
         SET status = 'completed', summary = $1, completed_at = NOW(), updated_at = NOW() \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(summary)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::InvalidSessionTransition {
            id,
            expected_status: "running",
        });
    }

    Ok(())
}

/// Marks a session `failed` with `error_message`.
///
/// # Errors
///
/// Returns [`DbError::InvalidSessionTransition`] if the session is not
/// `running`, or [`DbError::Sqlx`] if the update fails.
pub async fn fail_scrape_session(
    pool: &PgPool,
    id: SessionId,
    error_message: &str,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE scrape_sessions \
         SET status = 'failed', error_message = $1, completed_at = NOW(), updated_at = NOW() \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(error_message)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::InvalidSessionTransition {
            id,
            expected_status: "running",
        });
    }

    Ok(())
}

/// Fetches a single session by `id`.
///
/// # Errors
///
/// Returns [`DbError::NotFound`] if no row exists with the given `id`, or
/// [`DbError::Sqlx`] if the query fails.
pub async fn get_scrape_session(pool: &PgPool, id: SessionId) -> Result<ScrapeSessionRow, DbError> {
    let row = sqlx::query_as::<_, ScrapeSessionRow>(&format!(
        "SELECT {SESSION_COLUMNS} FROM scrape_sessions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// Returns the most recent `limit` sessions, newest first, optionally
/// restricted to one period.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_scrape_sessions(
    pool: &PgPool,
    period: Option<Period>,
    limit: i64,
) -> Result<Vec<ScrapeSessionRow>, DbError> {
    let rows = sqlx::query_as::<_, ScrapeSessionRow>(&format!(
        "SELECT {SESSION_COLUMNS} FROM scrape_sessions \
         WHERE $1::text IS NULL OR period = $1 \
         ORDER BY started_at DESC, id DESC \
         LIMIT $2"
    ))
    .bind(period.map(|p| p.to_string()))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
