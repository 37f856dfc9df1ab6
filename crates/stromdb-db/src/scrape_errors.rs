//! Database operations for `scrape_errors`.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use stromdb_core::{ErrorEntry, SessionId};

use crate::DbError;

/// A row from the `scrape_errors` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScrapeErrorRow {
    pub id: i64,
    pub session_id: i64,
    pub period: String,
    pub location_id: String,
    pub category: String,
    pub message: String,
    pub attempts: i32,
    pub url: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Inserts `entries` for `session_id` in one statement.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the insert fails (including a foreign-key
/// violation for an unknown session).
pub async fn insert_scrape_errors(
    pool: &PgPool,
    session_id: SessionId,
    entries: &[ErrorEntry],
) -> Result<u64, DbError> {
    if entries.is_empty() {
        return Ok(0);
    }

    let periods: Vec<String> = entries.iter().map(|e| e.period.to_string()).collect();
    let location_ids: Vec<&str> = entries.iter().map(|e| e.location_id.as_str()).collect();
    let categories: Vec<&str> = entries.iter().map(|e| e.category.as_str()).collect();
    let messages: Vec<&str> = entries.iter().map(|e| e.message.as_str()).collect();
    let attempts: Vec<i32> = entries
        .iter()
        .map(|e| i32::try_from(e.attempts).unwrap_or(i32::MAX))
        .collect();
    let urls: Vec<Option<&str>> = entries.iter().map(|e| e.url.as_deref()).collect();
    let occurred: Vec<DateTime<Utc>> = entries.iter().map(|e| e.occurred_at).collect();

    let result = sqlx::query(
        "INSERT INTO scrape_errors \
             (session_id, period, location_id, category, message, attempts, url, occurred_at) \
         SELECT $1, t.period, t.location_id, t.category, t.message, t.attempts, t.url, \
                t.occurred_at \
         FROM UNNEST($2::text[], $3::text[], $4::text[], $5::text[], $6::int4[], \
                     $7::text[], $8::timestamptz[]) \
              AS t(period, location_id, category, message, attempts, url, occurred_at)",
    )
    .bind(session_id)
    .bind(periods)
    .bind(location_ids)
    .bind(categories)
    .bind(messages)
    .bind(attempts)
    .bind(urls)
    .bind(occurred)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// All errors logged for `session_id`, oldest first.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_scrape_errors(
    pool: &PgPool,
    session_id: SessionId,
) -> Result<Vec<ScrapeErrorRow>, DbError> {
    let rows = sqlx::query_as::<_, ScrapeErrorRow>(
        "SELECT id, session_id, period, location_id, category, message, attempts, url, \
                occurred_at \
         FROM scrape_errors \
         WHERE session_id = $1 \
         ORDER BY occurred_at, id",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
