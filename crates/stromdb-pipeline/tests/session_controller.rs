//! End-to-end tests for `SessionController` against in-memory storage,
//! an in-memory checkpoint store and a scripted fetcher.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use stromdb_core::{
    DataSource, DuplicateMode, ErrorCategory, ExtractionMethod, OutlierSeverity, Period,
    PipelineConfig, PriceRecord, ReferenceTable, StorageBackend, StorageError, Strategy, Target,
};
use stromdb_pipeline::{
    Checkpoint, CheckpointError, CheckpointStore, MemoryCheckpointStore, MemorySessionStatus, MemoryStorage,
    RunOutcome, RunSummary, SessionController, SessionError, SessionPhase,
};
use stromdb_scraper::{FetchError, FetchedPage, Fetcher};

const URL_TEMPLATE: &str = "https://prices.example.test/strom/{id}";

#[derive(Debug, Clone)]
enum Reply {
    Page(String),
    NotFound,
    Timeout,
}

/// Serves scripted replies and counts calls per URL. Unknown URLs are 404s.
#[derive(Default)]
struct ScriptedFetcher {
    replies: HashMap<String, Reply>,
    calls: Mutex<HashMap<String, usize>>,
    /// Storage taken down the first time this URL is fetched.
    outage_on: Mutex<Option<(String, Arc<MemoryStorage>)>>,
}

impl ScriptedFetcher {
    fn with(mut self, location_id: &str, reply: Reply) -> Self {
        self.replies.insert(url_for(location_id), reply);
        self
    }

    fn calls(&self, location_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&url_for(location_id))
            .copied()
            .unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    fn take_storage_down_at(&self, location_id: &str, storage: Arc<MemoryStorage>) {
        *self.outage_on.lock().unwrap() = Some((url_for(location_id), storage));
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        *self.calls.lock().unwrap().entry(url.to_owned()).or_default() += 1;
        {
            let mut outage = self.outage_on.lock().unwrap();
            if outage.as_ref().is_some_and(|(at, _)| at == url) {
                if let Some((_, storage)) = outage.take() {
                    storage.set_unavailable(true);
                }
            }
        }
        match self.replies.get(url) {
            Some(Reply::Page(html)) => Ok(FetchedPage {
                url: url.to_owned(),
                html: html.clone(),
                status_code: 200,
            }),
            Some(Reply::Timeout) => Err(FetchError::Timeout {
                url: url.to_owned(),
            }),
            Some(Reply::NotFound) | None => Err(FetchError::NotFound {
                url: url.to_owned(),
            }),
        }
    }
}

fn url_for(location_id: &str) -> String {
    URL_TEMPLATE.replace("{id}", location_id)
}

fn price_page(city: &str, local_cents: &str, green_cents: &str) -> Reply {
    Reply::Page(format!(
        r#"<html><body>
<h1>Strompreise {city}</h1>
<table>
  <tr><td>Grundversorger</td><td>{local_cents} Cent pro kWh</td></tr>
  <tr><td>Günstigster Ökostrom</td><td>{green_cents} Cent pro kWh</td></tr>
</table>
</body></html>"#
    ))
}

fn period() -> Period {
    "2024-05".parse().unwrap()
}

fn targets(count: usize) -> Vec<Target> {
    (1..=count)
        .map(|i| Target::new(format!("t{i}"), format!("Stadt {i}")))
        .collect()
}

fn priced_fetcher(targets: &[Target]) -> ScriptedFetcher {
    targets.iter().fold(ScriptedFetcher::default(), |f, t| {
        f.with(&t.location_id, price_page(&t.display_name, "39,80", "28,10"))
    })
}

fn config() -> PipelineConfig {
    PipelineConfig {
        inter_request_delay_ms: 0,
        inter_batch_pause_ms: 0,
        max_retries: 3,
        retry_delay_ms: 0,
        batch_count: 3,
        checkpoint_interval: 1,
        auto_progress: true,
        fallback_enabled: false,
        storage_retry_delay_ms: 0,
        ..PipelineConfig::default()
    }
}

struct Harness {
    fetcher: Arc<ScriptedFetcher>,
    storage: Arc<MemoryStorage>,
    checkpoints: Arc<MemoryCheckpointStore>,
    reference: Arc<ReferenceTable>,
}

impl Harness {
    fn new(fetcher: ScriptedFetcher, targets: &[Target]) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            storage: Arc::new(MemoryStorage::new()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            reference: Arc::new(ReferenceTable::from_targets(targets)),
        }
    }

    fn controller(&self, config: PipelineConfig) -> SessionController {
        SessionController::new(
            self.fetcher.clone(),
            self.storage.clone(),
            self.checkpoints.clone(),
            self.reference.clone(),
            config,
            URL_TEMPLATE,
        )
    }
}

fn completed(outcome: RunOutcome) -> RunSummary {
    match outcome {
        RunOutcome::Completed(summary) => summary,
        other @ RunOutcome::Paused { .. } => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn auto_progress_runs_every_batch_in_one_call() {
    let targets = targets(6);
    let h = Harness::new(priced_fetcher(&targets), &targets);
    let mut controller = h.controller(config());

    let summary = completed(controller.run(period(), &targets).await.unwrap());

    assert_eq!(controller.phase(), SessionPhase::Completed);
    assert_eq!(summary.fetched, 6);
    assert_eq!(summary.persisted, 6);
    assert_eq!(summary.error_count(), 0);

    let records = h.storage.records(period());
    assert_eq!(records.len(), 6);
    let first = &records[0];
    assert_eq!(first.local_provider_price, Some(0.398));
    assert_eq!(first.green_energy_price, Some(0.281));
    assert_eq!(first.source, DataSource::Original);
    assert!(first.distance_km.abs() < f64::EPSILON);

    for t in &targets {
        assert_eq!(h.fetcher.calls(&t.location_id), 1, "{}", t.location_id);
    }
    assert!(h.checkpoints.get(period()).is_none(), "checkpoint cleared");

    let session = h.storage.session(1).unwrap();
    assert_eq!(session.status, MemorySessionStatus::Completed);
    assert_eq!(session.progress.processed_count, 6);
    assert_eq!(session.summary.unwrap()["persisted"], 6);
}

#[tokio::test]
async fn pauses_at_batch_boundary_and_continues_on_next_invocation() {
    let targets = targets(6);
    let h = Harness::new(priced_fetcher(&targets), &targets);
    let paused = PipelineConfig {
        auto_progress: false,
        ..config()
    };

    let first = h.controller(paused.clone()).run(period(), &targets).await.unwrap();
    assert_eq!(
        first,
        RunOutcome::Paused {
            next_batch_index: 1,
            total_batches: 3,
            processed: 2,
        }
    );
    assert_eq!(h.fetcher.total_calls(), 2);
    let checkpoint = h.checkpoints.get(period()).unwrap();
    assert_eq!(checkpoint.batch_index, 1);
    assert_eq!(checkpoint.processed_ids.len(), 2);

    let second = h.controller(paused.clone()).run(period(), &targets).await.unwrap();
    assert_eq!(
        second,
        RunOutcome::Paused {
            next_batch_index: 2,
            total_batches: 3,
            processed: 4,
        }
    );

    let summary = completed(h.controller(paused).run(period(), &targets).await.unwrap());
    assert_eq!(summary.fetched, 6, "summary spans all invocations");
    assert_eq!(h.storage.session_count(), 1, "one session across invocations");
    for t in &targets {
        assert_eq!(h.fetcher.calls(&t.location_id), 1, "{}", t.location_id);
    }
}

#[tokio::test]
async fn resume_fetches_only_unprocessed_targets() {
    let targets = targets(6);
    let h = Harness::new(priced_fetcher(&targets), &targets);
    let session_id = h
        .storage
        .start_session(period(), 6, &serde_json::json!({}))
        .await
        .unwrap();
    h.checkpoints
        .save(&Checkpoint {
            session_id,
            period: period(),
            batch_index: 1,
            total_batches: 3,
            total_targets: 6,
            processed_ids: ["t1", "t2", "t3"].into_iter().map(String::from).collect(),
            started_at: Utc::now(),
            saved_at: Utc::now(),
            accumulated_result_count: 3,
            accumulated_error_count: 0,
            summary: RunSummary::default(),
        })
        .await
        .unwrap();

    completed(h.controller(config()).run(period(), &targets).await.unwrap());

    for id in ["t1", "t2", "t3"] {
        assert_eq!(h.fetcher.calls(id), 0, "{id} must not be refetched");
    }
    for id in ["t4", "t5", "t6"] {
        assert_eq!(h.fetcher.calls(id), 1, "{id} fetched once");
    }
    assert_eq!(h.storage.session_count(), 1);
    let session = h.storage.session(session_id).unwrap();
    assert_eq!(session.status, MemorySessionStatus::Completed);
    assert_eq!(session.progress.processed_count, 6);
    assert_eq!(session.progress.result_count, 6);
}

#[tokio::test]
async fn incompatible_checkpoint_is_discarded() {
    let targets = targets(6);
    let h = Harness::new(priced_fetcher(&targets), &targets);
    let stale_session = h
        .storage
        .start_session(period(), 10, &serde_json::json!({}))
        .await
        .unwrap();
    h.checkpoints
        .save(&Checkpoint {
            session_id: stale_session,
            period: period(),
            batch_index: 2,
            total_batches: 5,
            total_targets: 10,
            processed_ids: ["t1", "t2"].into_iter().map(String::from).collect(),
            started_at: Utc::now(),
            saved_at: Utc::now(),
            accumulated_result_count: 2,
            accumulated_error_count: 0,
            summary: RunSummary::default(),
        })
        .await
        .unwrap();

    let summary = completed(h.controller(config()).run(period(), &targets).await.unwrap());

    assert_eq!(summary.fetched, 6);
    assert_eq!(h.fetcher.calls("t1"), 1);
    assert_eq!(h.storage.session_count(), 2, "a fresh session was started");
}

#[tokio::test]
async fn storage_outage_fails_session_and_resume_redoes_unflushed_work() {
    let targets = targets(4);
    let h = Harness::new(priced_fetcher(&targets), &targets);
    h.storage.set_unavailable(true);

    let mut controller = h.controller(config());
    let err = controller.run(period(), &targets).await.unwrap_err();
    assert!(
        matches!(err, SessionError::Storage(StorageError::Unavailable(_))),
        "got: {err:?}"
    );
    assert_eq!(controller.phase(), SessionPhase::Failed);

    let session = h.storage.session(1).unwrap();
    assert_eq!(session.status, MemorySessionStatus::Failed);
    assert!(session.error_message.is_some());

    let checkpoint = h.checkpoints.get(period()).expect("checkpoint kept");
    assert_eq!(checkpoint.batch_index, 0);
    assert!(
        checkpoint.processed_ids.is_empty(),
        "unflushed target is not marked processed"
    );
    assert_eq!(
        checkpoint.summary,
        RunSummary::default(),
        "unflushed target is not counted"
    );

    h.storage.set_unavailable(false);
    let summary = completed(controller.run(period(), &targets).await.unwrap());
    assert_eq!(summary.fetched, 4);
    assert_eq!(summary.persisted, 4);

    assert_eq!(h.storage.session_count(), 1, "failed session was resumed");
    assert_eq!(
        h.storage.session(1).unwrap().status,
        MemorySessionStatus::Completed
    );
    assert_eq!(h.storage.records(period()).len(), 4);
    assert_eq!(h.fetcher.calls("t1"), 2, "lost write is redone");
    assert_eq!(h.fetcher.calls("t2"), 1);
}

#[tokio::test]
async fn fetch_failures_are_categorized_and_retried_selectively() {
    let targets = targets(4);
    let fetcher = priced_fetcher(&targets)
        .with("t1", Reply::NotFound)
        .with("t2", Reply::Timeout)
        .with(
            "t3",
            Reply::Page("<html><body><p>Wartungsarbeiten</p></body></html>".to_owned()),
        );
    let h = Harness::new(fetcher, &targets);

    let summary = completed(h.controller(config()).run(period(), &targets).await.unwrap());

    assert_eq!(h.fetcher.calls("t1"), 1, "not_found is not retried");
    assert_eq!(h.fetcher.calls("t2"), 3, "timeouts use every attempt");
    assert_eq!(h.fetcher.calls("t3"), 1);

    assert_eq!(summary.fetched, 4);
    assert_eq!(summary.persisted, 1);
    assert_eq!(summary.errors_by_category[&ErrorCategory::NotFound], 1);
    assert_eq!(summary.errors_by_category[&ErrorCategory::Timeout], 1);
    assert_eq!(summary.errors_by_category[&ErrorCategory::InvalidPage], 1);

    let errors = h.storage.errors(1);
    assert_eq!(errors.len(), 3);
    let timeout = errors
        .iter()
        .find(|e| e.category == ErrorCategory::Timeout)
        .unwrap();
    assert_eq!(timeout.location_id, "t2");
    assert_eq!(timeout.attempts, 3);
    assert_eq!(timeout.url.as_deref(), Some(url_for("t2").as_str()));
}

#[tokio::test]
async fn outliers_are_counted_but_still_stored() {
    let targets = targets(1);
    let fetcher = ScriptedFetcher::default().with("t1", price_page("Insel", "160,00", "150,00"));
    let h = Harness::new(fetcher, &targets);

    let summary = completed(h.controller(config()).run(period(), &targets).await.unwrap());

    assert_eq!(summary.persisted, 1);
    assert_eq!(summary.outliers_by_severity[&OutlierSeverity::Extreme], 1);
    let record = &h.storage.records(period())[0];
    assert!(record.outlier.has_outlier);
    assert_eq!(record.outlier.severity, OutlierSeverity::Extreme);
}

fn stored(location_id: &str, local: f64) -> PriceRecord {
    PriceRecord::original(
        &Target::new(location_id, location_id),
        period(),
        Some(local),
        None,
        ExtractionMethod::Single(Strategy::SimpleTable),
        url_for(location_id),
    )
}

#[tokio::test]
async fn skip_mode_leaves_existing_records_alone() {
    let targets = targets(3);
    let h = Harness::new(priced_fetcher(&targets), &targets);
    h.storage.upsert_record(&stored("t1", 0.5)).await.unwrap();

    let summary = completed(h.controller(config()).run(period(), &targets).await.unwrap());

    assert_eq!(h.fetcher.calls("t1"), 0);
    assert_eq!(summary.skipped_existing, 1);
    assert_eq!(summary.fetched, 2);
    let records = h.storage.records(period());
    let t1 = records.iter().find(|r| r.location_id == "t1").unwrap();
    assert_eq!(t1.local_provider_price, Some(0.5));
}

#[tokio::test]
async fn overwrite_mode_refetches_existing_records() {
    let targets = targets(3);
    let h = Harness::new(priced_fetcher(&targets), &targets);
    h.storage.upsert_record(&stored("t1", 0.5)).await.unwrap();
    let overwrite = PipelineConfig {
        duplicate_mode: DuplicateMode::Overwrite,
        ..config()
    };

    let summary = completed(h.controller(overwrite).run(period(), &targets).await.unwrap());

    assert_eq!(h.fetcher.calls("t1"), 1);
    assert_eq!(summary.skipped_existing, 0);
    let records = h.storage.records(period());
    assert_eq!(records.len(), 3);
    let t1 = records.iter().find(|r| r.location_id == "t1").unwrap();
    assert_eq!(t1.local_provider_price, Some(0.398));
}

#[tokio::test]
async fn fallback_fills_targets_near_a_scraped_neighbour() {
    let targets = vec![
        Target::new("10115", "Berlin").with_coordinates(52.5200, 13.4050),
        Target::new("14467", "Potsdam").with_coordinates(52.3906, 13.0645),
        Target::new("80331", "München").with_coordinates(48.1371, 11.5754),
    ];
    let fetcher = ScriptedFetcher::default().with("10115", price_page("Berlin", "39,80", "28,10"));
    let h = Harness::new(fetcher, &targets);
    let with_fallback = PipelineConfig {
        fallback_enabled: true,
        ..config()
    };

    let summary = completed(
        h.controller(with_fallback)
            .run(period(), &targets)
            .await
            .unwrap(),
    );

    assert_eq!(summary.persisted, 1);
    assert_eq!(summary.fallback_persisted, 1);
    assert_eq!(summary.fallback_unresolved, 1, "München is out of range");

    let records = h.storage.records(period());
    assert_eq!(records.len(), 2);
    let potsdam = records.iter().find(|r| r.location_id == "14467").unwrap();
    assert_eq!(potsdam.source, DataSource::Fallback);
    assert_eq!(potsdam.source_location_id.as_deref(), Some("10115"));
    assert!(potsdam.distance_km > 20.0 && potsdam.distance_km < 35.0);
    assert_eq!(potsdam.local_provider_price, Some(0.398));
    assert!(records.iter().all(|r| r.location_id != "80331"));
}

#[tokio::test]
async fn invalid_target_lists_are_rejected_before_any_session() {
    let h = Harness::new(ScriptedFetcher::default(), &[]);

    let err = h.controller(config()).run(period(), &[]).await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidInput(_)), "got: {err:?}");

    let duplicated = vec![Target::new("t1", "Eins"), Target::new("t1", "Eins")];
    let err = h
        .controller(config())
        .run(period(), &duplicated)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidInput(_)), "got: {err:?}");

    assert_eq!(h.storage.session_count(), 0);
    assert_eq!(h.fetcher.total_calls(), 0);
}

fn ids(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|id| (*id).to_owned()).collect()
}

#[tokio::test]
async fn mid_batch_checkpoints_bound_the_work_lost_to_an_outage() {
    let targets = targets(5);
    let h = Harness::new(priced_fetcher(&targets), &targets);
    h.fetcher.take_storage_down_at("t3", h.storage.clone());
    let every_two = PipelineConfig {
        batch_count: 1,
        checkpoint_interval: 2,
        ..config()
    };

    let err = h
        .controller(every_two.clone())
        .run(period(), &targets)
        .await
        .unwrap_err();
    assert!(
        matches!(err, SessionError::Storage(StorageError::Unavailable(_))),
        "got: {err:?}"
    );

    let checkpoint = h.checkpoints.get(period()).expect("checkpoint kept");
    assert_eq!(checkpoint.processed_ids, ids(&["t1", "t2"]));
    assert_eq!(checkpoint.batch_index, 0);
    assert_eq!(checkpoint.summary.fetched, 2);
    assert_eq!(checkpoint.summary.persisted, 2);
    assert_eq!(
        h.checkpoints.save_count(),
        2,
        "one interval checkpoint, one on failure"
    );
    assert_eq!(h.fetcher.calls("t5"), 0, "run stopped at the failed checkpoint");
    assert_eq!(h.storage.records(period()).len(), 2);

    h.storage.set_unavailable(false);
    let summary = completed(h.controller(every_two).run(period(), &targets).await.unwrap());

    assert_eq!(summary.fetched, 5);
    assert_eq!(summary.persisted, 5);
    assert_eq!(h.storage.records(period()).len(), 5);
    assert_eq!(h.storage.session_count(), 1);
    for (id, calls) in [("t1", 1), ("t2", 1), ("t3", 2), ("t4", 2), ("t5", 1)] {
        assert_eq!(h.fetcher.calls(id), calls, "{id}");
    }
}

#[tokio::test]
async fn writes_landed_during_cleanup_count_as_processed() {
    let targets = targets(3);
    let h = Harness::new(priced_fetcher(&targets), &targets);
    h.storage.fail_next_writes(1);
    let config = PipelineConfig {
        batch_count: 1,
        checkpoint_interval: 10,
        result_batch_size: 2,
        storage_max_retries: 1,
        duplicate_mode: DuplicateMode::Overwrite,
        ..config()
    };

    let err = h
        .controller(config.clone())
        .run(period(), &targets)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Storage(_)), "got: {err:?}");

    let checkpoint = h.checkpoints.get(period()).expect("checkpoint kept");
    assert_eq!(checkpoint.processed_ids, ids(&["t1", "t2"]));
    assert_eq!(checkpoint.summary.persisted, 2);
    assert_eq!(h.storage.records(period()).len(), 2);

    let summary = completed(h.controller(config).run(period(), &targets).await.unwrap());

    assert_eq!(summary.fetched, 3);
    assert_eq!(summary.persisted, 3);
    for t in &targets {
        assert_eq!(h.fetcher.calls(&t.location_id), 1, "{}", t.location_id);
    }
}

/// Fails the first `failures` saves with a transient error.
struct FlakyCheckpoints {
    inner: MemoryCheckpointStore,
    failures: AtomicUsize,
    save_attempts: AtomicUsize,
}

impl FlakyCheckpoints {
    fn failing(failures: usize) -> Self {
        Self {
            inner: MemoryCheckpointStore::new(),
            failures: AtomicUsize::new(failures),
            save_attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CheckpointStore for FlakyCheckpoints {
    async fn load(&self, period: Period) -> Result<Option<Checkpoint>, CheckpointError> {
        self.inner.load(period).await
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CheckpointError::Unavailable("disk busy".to_owned()));
        }
        self.inner.save(checkpoint).await
    }

    async fn clear(&self, period: Period) -> Result<(), CheckpointError> {
        self.inner.clear(period).await
    }
}

fn controller_with(h: &Harness, checkpoints: Arc<FlakyCheckpoints>) -> SessionController {
    SessionController::new(
        h.fetcher.clone(),
        h.storage.clone(),
        checkpoints,
        h.reference.clone(),
        config(),
        URL_TEMPLATE,
    )
}

#[tokio::test]
async fn transient_checkpoint_failures_are_retried() {
    let targets = targets(3);
    let h = Harness::new(priced_fetcher(&targets), &targets);
    let checkpoints = Arc::new(FlakyCheckpoints::failing(2));

    let summary = completed(
        controller_with(&h, checkpoints.clone())
            .run(period(), &targets)
            .await
            .unwrap(),
    );

    assert_eq!(summary.persisted, 3);
    assert_eq!(
        h.storage.session(1).unwrap().status,
        MemorySessionStatus::Completed
    );
    assert!(checkpoints.inner.save_count() > 0);
    assert_eq!(
        checkpoints.save_attempts.load(Ordering::SeqCst),
        checkpoints.inner.save_count() + 2
    );
}

#[tokio::test]
async fn persistent_checkpoint_failure_fails_the_session() {
    let targets = targets(3);
    let h = Harness::new(priced_fetcher(&targets), &targets);
    let checkpoints = Arc::new(FlakyCheckpoints::failing(100));
    let mut controller = controller_with(&h, checkpoints.clone());

    let err = controller.run(period(), &targets).await.unwrap_err();

    assert!(
        matches!(err, SessionError::Checkpoint(CheckpointError::Unavailable(_))),
        "got: {err:?}"
    );
    assert_eq!(controller.phase(), SessionPhase::Failed);
    assert_eq!(
        h.storage.session(1).unwrap().status,
        MemorySessionStatus::Failed
    );
    assert_eq!(
        checkpoints.save_attempts.load(Ordering::SeqCst),
        6,
        "three attempts for the interval checkpoint, three on failure"
    );
    assert_eq!(h.fetcher.total_calls(), 1);
}
