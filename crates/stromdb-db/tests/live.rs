//! Live integration tests for stromdb-db using `#[sqlx::test]`.
//!
//! Each test gets a fresh, fully-migrated Postgres database spun up by the
//! sqlx test harness. The `migrations` path is relative to the crate root
//! (`crates/stromdb-db/`), so `"../../migrations"` resolves to the workspace
//! migration directory.

use chrono::Utc;
use stromdb_core::{
    DataSource, ErrorCategory, ErrorEntry, ExtractionMethod, OutlierSeverity, Period, PriceRecord,
    SessionProgress, StorageBackend, StorageError, Strategy, Target,
};
use stromdb_db::{
    bulk_upsert_price_records, complete_scrape_session, create_scrape_session,
    fail_scrape_session, get_scrape_session, insert_scrape_errors, list_existing_location_ids,
    list_period_price_records, list_scrape_errors, list_scrape_sessions, price_record_exists,
    resume_scrape_session, update_scrape_session_progress, upsert_price_record, DbError,
    PgStorage,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn period() -> Period {
    "2024-05".parse().expect("valid period")
}

fn original(location_id: &str, local: f64, green: Option<f64>) -> PriceRecord {
    PriceRecord::original(
        &Target::new(location_id, location_id).with_coordinates(52.52, 13.405),
        period(),
        Some(local),
        green,
        ExtractionMethod::Single(Strategy::StandardTable),
        format!("https://prices.example.test/{location_id}"),
    )
}

fn fallback(location_id: &str, donor: &PriceRecord, distance_km: f64) -> PriceRecord {
    PriceRecord {
        location_id: location_id.to_string(),
        source: DataSource::Fallback,
        source_location_id: Some(donor.location_id.clone()),
        distance_km,
        ..donor.clone()
    }
}

fn error_entry(location_id: &str, category: ErrorCategory) -> ErrorEntry {
    ErrorEntry {
        location_id: location_id.to_string(),
        period: period(),
        category,
        message: format!("{category} for {location_id}"),
        attempts: 3,
        url: Some(format!("https://prices.example.test/{location_id}")),
        occurred_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Section 1: Price records
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../migrations")]
async fn price_record_upsert_replaces_existing_row(pool: sqlx::PgPool) {
    upsert_price_record(&pool, &original("10115", 0.41, Some(0.30)))
        .await
        .expect("first upsert failed");
    upsert_price_record(&pool, &original("10115", 0.398, Some(0.281)))
        .await
        .expect("second upsert failed");

    let rows = list_period_price_records(&pool, period())
        .await
        .expect("list_period_price_records failed");
    assert_eq!(rows.len(), 1, "upsert must not duplicate");

    let record = rows[0].clone().into_record().expect("row decodes");
    assert_eq!(record.local_provider_price, Some(0.398));
    assert_eq!(record.green_energy_price, Some(0.281));
    assert_eq!(record.source, DataSource::Original);
    assert!(rows[0].updated_at >= rows[0].created_at);
}

#[sqlx::test(migrations = "../../migrations")]
async fn bulk_upsert_keeps_last_of_repeated_keys(pool: sqlx::PgPool) {
    let berlin = original("10115", 0.398, Some(0.281));
    let records = vec![
        original("10115", 0.5, None),
        original("20095", 0.37, Some(0.29)),
        berlin.clone(),
        fallback("14467", &berlin, 27.12),
    ];

    let written = bulk_upsert_price_records(&pool, &records)
        .await
        .expect("bulk upsert failed");
    assert_eq!(written, 3);

    let ids = list_existing_location_ids(&pool, period())
        .await
        .expect("list_existing_location_ids failed");
    assert_eq!(ids.len(), 3);
    assert!(ids.contains("14467"));

    let stored: Vec<PriceRecord> = list_period_price_records(&pool, period())
        .await
        .expect("list failed")
        .into_iter()
        .map(|row| row.into_record().expect("row decodes"))
        .collect();
    let stored_berlin = stored.iter().find(|r| r.location_id == "10115").unwrap();
    assert_eq!(stored_berlin.local_provider_price, Some(0.398));
    let potsdam = stored.iter().find(|r| r.location_id == "14467").unwrap();
    assert_eq!(potsdam.source, DataSource::Fallback);
    assert_eq!(potsdam.source_location_id.as_deref(), Some("10115"));
    assert!((potsdam.distance_km - 27.12).abs() < 1e-9);
}

#[sqlx::test(migrations = "../../migrations")]
async fn outlier_assessment_round_trips(pool: sqlx::PgPool) {
    let mut record = original("99999", 1.6, Some(0.4));
    record.outlier.has_outlier = true;
    record.outlier.severity = OutlierSeverity::Extreme;
    record.outlier.warnings = vec!["extreme price difference: 300%".to_string()];

    upsert_price_record(&pool, &record).await.expect("upsert failed");

    let rows = list_period_price_records(&pool, period())
        .await
        .expect("list failed");
    let back = rows[0].clone().into_record().expect("row decodes");
    assert_eq!(back.outlier, record.outlier);
}

#[sqlx::test(migrations = "../../migrations")]
async fn fallback_without_distance_violates_schema(pool: sqlx::PgPool) {
    let donor = original("10115", 0.398, None);
    let mut bad = fallback("14467", &donor, 27.0);
    bad.distance_km = 0.0;

    let err = upsert_price_record(&pool, &bad).await.unwrap_err();
    assert!(matches!(err, DbError::Sqlx(sqlx::Error::Database(_))), "got: {err:?}");
}

#[sqlx::test(migrations = "../../migrations")]
async fn record_exists_is_scoped_to_period(pool: sqlx::PgPool) {
    upsert_price_record(&pool, &original("10115", 0.398, None))
        .await
        .expect("upsert failed");

    assert!(price_record_exists(&pool, period(), "10115").await.unwrap());
    let other: Period = "2024-06".parse().unwrap();
    assert!(!price_record_exists(&pool, other, "10115").await.unwrap());
}

// ---------------------------------------------------------------------------
// Section 2: Scrape session lifecycle
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../migrations")]
async fn scrape_session_lifecycle_running_to_completed(pool: sqlx::PgPool) {
    let id = create_scrape_session(&pool, period(), 12, &serde_json::json!({"batch_count": 3}))
        .await
        .expect("create_scrape_session failed");

    let progress = SessionProgress {
        batch_index: 1,
        total_batches: 3,
        processed_count: 4,
        result_count: 3,
        error_count: 1,
    };
    update_scrape_session_progress(&pool, id, &progress)
        .await
        .expect("update failed");

    complete_scrape_session(&pool, id, &serde_json::json!({"persisted": 3}))
        .await
        .expect("complete failed");

    let row = get_scrape_session(&pool, id).await.expect("get failed");
    assert_eq!(row.status, "completed");
    assert_eq!(row.period, "2024-05");
    assert_eq!(row.total_targets, 12);
    assert_eq!(row.processed_count, 4);
    assert_eq!(row.error_count, 1);
    assert_eq!(row.config_snapshot["batch_count"], 3);
    assert_eq!(row.summary.expect("summary")["persisted"], 3);
    assert!(row.completed_at.is_some());
}

#[sqlx::test(migrations = "../../migrations")]
async fn failed_session_can_be_resumed(pool: sqlx::PgPool) {
    let id = create_scrape_session(&pool, period(), 4, &serde_json::json!({}))
        .await
        .expect("create failed");
    fail_scrape_session(&pool, id, "storage unavailable")
        .await
        .expect("fail failed");

    resume_scrape_session(&pool, id).await.expect("resume failed");

    let row = get_scrape_session(&pool, id).await.expect("get failed");
    assert_eq!(row.status, "running");
    assert!(row.error_message.is_none());
    assert!(row.completed_at.is_none());
}

#[sqlx::test(migrations = "../../migrations")]
async fn completed_session_rejects_further_transitions(pool: sqlx::PgPool) {
    let id = create_scrape_session(&pool, period(), 4, &serde_json::json!({}))
        .await
        .expect("create failed");
    complete_scrape_session(&pool, id, &serde_json::json!({}))
        .await
        .expect("complete failed");

    let err = resume_scrape_session(&pool, id).await.unwrap_err();
    assert!(
        matches!(err, DbError::InvalidSessionTransition { .. }),
        "got: {err:?}"
    );
    let err = fail_scrape_session(&pool, id, "late").await.unwrap_err();
    assert!(
        matches!(err, DbError::InvalidSessionTransition { .. }),
        "got: {err:?}"
    );
}

#[sqlx::test(migrations = "../../migrations")]
async fn unknown_session_is_not_found(pool: sqlx::PgPool) {
    let err = get_scrape_session(&pool, 9_999).await.unwrap_err();
    assert!(matches!(err, DbError::NotFound), "got: {err:?}");
}

#[sqlx::test(migrations = "../../migrations")]
async fn sessions_are_listed_newest_first_per_period(pool: sqlx::PgPool) {
    let first = create_scrape_session(&pool, period(), 1, &serde_json::json!({}))
        .await
        .unwrap();
    let second = create_scrape_session(&pool, period(), 1, &serde_json::json!({}))
        .await
        .unwrap();
    let other: Period = "2024-06".parse().unwrap();
    create_scrape_session(&pool, other, 1, &serde_json::json!({}))
        .await
        .unwrap();

    let rows = list_scrape_sessions(&pool, Some(period()), 10).await.unwrap();
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![second, first]);

    let all = list_scrape_sessions(&pool, None, 10).await.unwrap();
    assert_eq!(all.len(), 3);
}

// ---------------------------------------------------------------------------
// Section 3: Error log
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../migrations")]
async fn scrape_errors_are_stored_per_session(pool: sqlx::PgPool) {
    let id = create_scrape_session(&pool, period(), 2, &serde_json::json!({}))
        .await
        .unwrap();
    let entries = vec![
        error_entry("10115", ErrorCategory::Timeout),
        error_entry("99998", ErrorCategory::NotFound),
    ];

    let inserted = insert_scrape_errors(&pool, id, &entries).await.unwrap();
    assert_eq!(inserted, 2);

    let rows = list_scrape_errors(&pool, id).await.unwrap();
    assert_eq!(rows.len(), 2);
    let timeout = rows.iter().find(|r| r.location_id == "10115").unwrap();
    assert_eq!(timeout.category, "timeout");
    assert_eq!(timeout.attempts, 3);
}

// ---------------------------------------------------------------------------
// Section 4: StorageBackend adapter
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../migrations")]
async fn pg_storage_maps_session_errors(pool: sqlx::PgPool) {
    let storage = PgStorage::new(pool);
    let id = storage
        .start_session(period(), 3, &serde_json::json!({}))
        .await
        .unwrap();
    storage
        .complete_session(id, &serde_json::json!({}))
        .await
        .unwrap();

    let err = storage
        .update_session(id, &SessionProgress::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, StorageError::InvalidSessionTransition { .. }),
        "got: {err:?}"
    );
    assert!(!err.is_transient());
}

#[sqlx::test(migrations = "../../migrations")]
async fn pg_storage_round_trips_period_records(pool: sqlx::PgPool) {
    let storage = PgStorage::new(pool);
    let berlin = original("10115", 0.398, Some(0.281));
    let records = vec![berlin.clone(), fallback("14467", &berlin, 27.12)];

    assert_eq!(storage.bulk_upsert(&records).await.unwrap(), 2);
    assert!(storage.record_exists(period(), "14467").await.unwrap());

    let back = storage.period_records(period()).await.unwrap();
    assert_eq!(back.len(), 2);
    assert_eq!(back[0].location_id, "10115");
    let average = back[0].average_price.expect("average stored");
    assert!((average - 0.3395).abs() < 1e-9, "got {average}");
}
