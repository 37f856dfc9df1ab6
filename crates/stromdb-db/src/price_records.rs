//! Database operations for `price_records`.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::PgPool;
use stromdb_core::{Coordinates, OutlierAssessment, Period, PriceRecord};

use crate::DbError;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A row from the `price_records` table.
///
/// Prices are `NUMERIC(8,4)` in the schema, i.e. EUR/kWh to four decimals.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PriceRecordRow {
    pub id: i64,
    pub period: String,
    pub location_id: String,
    pub local_provider_price: Option<Decimal>,
    pub green_energy_price: Option<Decimal>,
    pub average_price: Option<Decimal>,
    /// `ORIGINAL` or `FALLBACK`.
    pub data_source: String,
    pub source_location_id: Option<String>,
    pub distance_km: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub has_outlier: bool,
    pub outlier_severity: String,
    /// JSON array of strings.
    pub outlier_warnings: serde_json::Value,
    pub extraction_method: String,
    pub raw_source_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PriceRecordRow {
    /// Converts the row back into the domain type.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidRow`] if a text column holds a value the
    /// domain enums do not know, or a price does not fit an `f64`.
    pub fn into_record(self) -> Result<PriceRecord, DbError> {
        let invalid = |reason: String| DbError::InvalidRow {
            location_id: self.location_id.clone(),
            reason,
        };
        let price = |value: Option<Decimal>| -> Result<Option<f64>, DbError> {
            value
                .map(|d| {
                    d.to_f64()
                        .ok_or_else(|| invalid(format!("price {d} is not representable")))
                })
                .transpose()
        };

        let period: Period = self.period.parse().map_err(|e| invalid(format!("{e}")))?;
        let warnings: Vec<String> = serde_json::from_value(self.outlier_warnings.clone())
            .map_err(|e| invalid(format!("outlier_warnings: {e}")))?;

        Ok(PriceRecord {
            period,
            local_provider_price: price(self.local_provider_price)?,
            green_energy_price: price(self.green_energy_price)?,
            average_price: price(self.average_price)?,
            source: self.data_source.parse().map_err(|e| invalid(format!("{e}")))?,
            source_location_id: self.source_location_id.clone(),
            distance_km: self.distance_km,
            coordinates: match (self.latitude, self.longitude) {
                (Some(latitude), Some(longitude)) => Some(Coordinates::new(latitude, longitude)),
                _ => None,
            },
            outlier: OutlierAssessment {
                has_outlier: self.has_outlier,
                severity: self
                    .outlier_severity
                    .parse()
                    .map_err(|e| invalid(format!("{e}")))?,
                warnings,
            },
            extraction_method: self
                .extraction_method
                .parse()
                .map_err(|e| invalid(format!("{e}")))?,
            raw_source_url: self.raw_source_url.clone(),
            location_id: self.location_id,
        })
    }
}

// ---------------------------------------------------------------------------
// price_records operations
// ---------------------------------------------------------------------------

/// Returns `true` if a record exists for `(period, location_id)`.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn price_record_exists(
    pool: &PgPool,
    period: Period,
    location_id: &str,
) -> Result<bool, DbError> {
    let exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS ( \
             SELECT 1 FROM price_records WHERE period = $1 AND location_id = $2 \
         )",
    )
    .bind(period.to_string())
    .bind(location_id)
    .fetch_one(pool)
    .await?;

    Ok(exists)
}

/// Every `location_id` with a record for `period`.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_existing_location_ids(
    pool: &PgPool,
    period: Period,
) -> Result<HashSet<String>, DbError> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT location_id FROM price_records WHERE period = $1",
    )
    .bind(period.to_string())
    .fetch_all(pool)
    .await?;

    Ok(ids.into_iter().collect())
}

/// All records for `period`, ordered by `location_id`.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_period_price_records(
    pool: &PgPool,
    period: Period,
) -> Result<Vec<PriceRecordRow>, DbError> {
    let rows = sqlx::query_as::<_, PriceRecordRow>(
        "SELECT id, period, location_id, local_provider_price, green_energy_price, \
                average_price, data_source, source_location_id, distance_km, \
                latitude, longitude, has_outlier, outlier_severity, outlier_warnings, \
                extraction_method, raw_source_url, created_at, updated_at \
         FROM price_records \
         WHERE period = $1 \
         ORDER BY location_id",
    )
    .bind(period.to_string())
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Upserts a single record.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the upsert fails.
pub async fn upsert_price_record(pool: &PgPool, record: &PriceRecord) -> Result<(), DbError> {
    bulk_upsert_price_records(pool, std::slice::from_ref(record)).await?;
    Ok(())
}

/// Upserts many records in one statement.
///
/// Rows are passed as parallel arrays and expanded with `UNNEST`. Conflicts
/// on `(period, location_id)` replace every data column and bump
/// `updated_at`. Postgres rejects a statement that touches the same row
/// twice, so for repeated keys only the last record in `records` is sent.
///
/// Prices are bound as `float8` and cast to `NUMERIC(8,4)` by the database.
///
/// Returns the number of rows inserted or updated.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the upsert fails.
pub async fn bulk_upsert_price_records(
    pool: &PgPool,
    records: &[PriceRecord],
) -> Result<u64, DbError> {
    if records.is_empty() {
        return Ok(0);
    }

    let mut seen = HashSet::with_capacity(records.len());
    let mut unique: Vec<&PriceRecord> = records
        .iter()
        .rev()
        .filter(|r| seen.insert((r.period, r.location_id.as_str())))
        .collect();
    unique.reverse();

    let mut periods = Vec::with_capacity(unique.len());
    let mut location_ids = Vec::with_capacity(unique.len());
    let mut local_prices = Vec::with_capacity(unique.len());
    let mut green_prices = Vec::with_capacity(unique.len());
    let mut average_prices = Vec::with_capacity(unique.len());
    let mut sources = Vec::with_capacity(unique.len());
    let mut source_location_ids = Vec::with_capacity(unique.len());
    let mut distances = Vec::with_capacity(unique.len());
    let mut latitudes = Vec::with_capacity(unique.len());
    let mut longitudes = Vec::with_capacity(unique.len());
    let mut has_outliers = Vec::with_capacity(unique.len());
    let mut severities = Vec::with_capacity(unique.len());
    let mut warnings = Vec::with_capacity(unique.len());
    let mut methods = Vec::with_capacity(unique.len());
    let mut urls = Vec::with_capacity(unique.len());

    for record in unique {
        periods.push(record.period.to_string());
        location_ids.push(record.location_id.clone());
        local_prices.push(record.local_provider_price);
        green_prices.push(record.green_energy_price);
        average_prices.push(record.average_price);
        sources.push(record.source.as_str().to_string());
        source_location_ids.push(record.source_location_id.clone());
        distances.push(record.distance_km);
        latitudes.push(record.coordinates.map(|c| c.latitude));
        longitudes.push(record.coordinates.map(|c| c.longitude));
        has_outliers.push(record.outlier.has_outlier);
        severities.push(record.outlier.severity.as_str().to_string());
        warnings.push(serde_json::Value::from(record.outlier.warnings.clone()).to_string());
        methods.push(record.extraction_method.to_string());
        urls.push(record.raw_source_url.clone());
    }

    let result = sqlx::query(
        "INSERT INTO price_records \
             (period, location_id, local_provider_price, green_energy_price, average_price, \
              data_source, source_location_id, distance_km, latitude, longitude, \
              has_outlier, outlier_severity, outlier_warnings, extraction_method, raw_source_url) \
         SELECT t.period, t.location_id, \
                t.local_price::numeric(8,4), t.green_price::numeric(8,4), \
                t.average_price::numeric(8,4), \
                t.data_source, t.source_location_id, t.distance_km, t.latitude, t.longitude, \
                t.has_outlier, t.outlier_severity, t.outlier_warnings::jsonb, \
                t.extraction_method, t.raw_source_url \
         FROM UNNEST( \
             $1::text[], $2::text[], $3::float8[], $4::float8[], $5::float8[], \
             $6::text[], $7::text[], $8::float8[], $9::float8[], $10::float8[], \
             $11::bool[], $12::text[], $13::text[], $14::text[], $15::text[] \
         ) AS t(period, location_id, local_price, green_price, average_price, \
                data_source, source_location_id, distance_km, latitude, longitude, \
                has_outlier, outlier_severity, outlier_warnings, extraction_method, \
                raw_source_url) \
         ON CONFLICT (period, location_id) DO UPDATE SET \
             local_provider_price = EXCLUDED.local_provider_price, \
             green_energy_price   = EXCLUDED.green_energy_price, \
             average_price        = EXCLUDED.average_price, \
             data_source          = EXCLUDED.data_source, \
             source_location_id   = EXCLUDED.source_location_id, \
             distance_km          = EXCLUDED.distance_km, \
             latitude             = EXCLUDED.latitude, \
             longitude            = EXCLUDED.longitude, \
             has_outlier          = EXCLUDED.has_outlier, \
             outlier_severity     = EXCLUDED.outlier_severity, \
             outlier_warnings     = EXCLUDED.outlier_warnings, \
             extraction_method    = EXCLUDED.extraction_method, \
             raw_source_url       = EXCLUDED.raw_source_url, \
             updated_at           = NOW()",
    )
    .bind(periods)
    .bind(location_ids)
    .bind(local_prices)
    .bind(green_prices)
    .bind(average_prices)
    .bind(sources)
    .bind(source_location_ids)
    .bind(distances)
    .bind(latitudes)
    .bind(longitudes)
    .bind(has_outliers)
    .bind(severities)
    .bind(warnings)
    .bind(methods)
    .bind(urls)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
