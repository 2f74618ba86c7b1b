use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde_json::json;
use shiftsync_adapters::{load_fixture_bundle, FixtureSheetSource, FINAL_OUTPUT};
use shiftsync_core::{CachedRow, DateRange, SheetErrorKind, SyncStatus, TriggerKind};
use shiftsync_storage::{BackoffPolicy, SnapshotCache, SourceError};
use shiftsync_sync::store::{CachedRowStore, SyncRecordStore};
use shiftsync_sync::{
    MappingWrite, MemoryStore, SkipReason, SyncConfig, SyncEngine, SyncOutcomeStatus, SyncRequest,
    TargetRegistry,
};

const TARGET: &str = "ward-a-2025-11";
const RESULTS_DOC: &str = "demo-results";
const RESULTS_TITLE: &str = "排班結果表 ";

const TARGETS_YAML: &str = r#"
targets:
  - target_id: ward-a-2025-11
    tenant: ward-a
    display_name: Ward A November
    parameters_document: demo-params
    results_document: demo-results
"#;

struct Harness {
    engine: Arc<SyncEngine>,
    source: Arc<FixtureSheetSource>,
    store: Arc<MemoryStore>,
}

fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.fetcher.backoff = BackoffPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
    };
    config.read_deadline = Duration::from_secs(2);
    config
}

async fn harness_with(config: SyncConfig) -> Harness {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let bundle = load_fixture_bundle(root.join("fixtures/demo/bundle.json")).unwrap();
    let source = Arc::new(FixtureSheetSource::new(&bundle));
    let store = Arc::new(MemoryStore::new());
    store.seed_entities(TARGET, bundle.entities.clone()).await;

    let registry = TargetRegistry::from_yaml_str(TARGETS_YAML).unwrap();
    let cache = Arc::new(SnapshotCache::new(config.cache));
    let engine = Arc::new(SyncEngine::new(
        &config,
        registry,
        store.clone(),
        source.clone(),
        cache,
    ));
    Harness {
        engine,
        source,
        store,
    }
}

async fn harness() -> Harness {
    harness_with(test_config()).await
}

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 11, day).unwrap()
}

fn forced() -> SyncRequest {
    SyncRequest::new(TriggerKind::Interactive).forced().by("ops@example.test")
}

async fn snapshot_rows(store: &MemoryStore) -> Vec<(String, NaiveDate, String, String)> {
    store
        .query_rows(TARGET, None, None)
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.entity_id, r.date, r.category, r.value))
        .collect()
}

#[tokio::test]
async fn composite_cells_bind_rows_to_their_entities() {
    let h = harness().await;
    let outcome = h
        .engine
        .trigger_sync(TARGET, SyncRequest::new(TriggerKind::Interactive))
        .await
        .unwrap();

    assert_eq!(outcome.status, SyncOutcomeStatus::Succeeded);
    assert_eq!(outcome.entities_synced, 3);
    assert_eq!(outcome.entities_unmatched, 2);
    assert_eq!(outcome.rows_affected, 9);
    assert_eq!(outcome.replaced_range, Some(DateRange::new(d(1), d(3))));
    let mut unmatched: Vec<_> = outcome.unmatched.iter().map(|r| r.entity_id.as_str()).collect();
    unmatched.sort();
    assert_eq!(unmatched, vec!["4", "6"]);

    let wang = h.engine.get_cached_rows("2", TARGET, None).await.unwrap();
    let cells: Vec<(NaiveDate, &str, &str)> = wang
        .iter()
        .map(|r| (r.date, r.category.as_str(), r.value.as_str()))
        .collect();
    assert_eq!(
        cells,
        vec![(d(1), "N", "N"), (d(2), "OFF", "休"), (d(3), "D", "D")]
    );

    let lin = h
        .engine
        .get_cached_rows("3", TARGET, Some(DateRange::new(d(3), d(3))))
        .await
        .unwrap();
    assert_eq!(lin[0].category, "ASSIGN");
    assert_eq!(lin[0].value, "A 櫃台人力");

    let mappings = h.engine.list_mappings(TARGET).await.unwrap();
    let e04 = mappings.iter().find(|m| m.external_id == "E04").unwrap();
    assert_eq!(e04.entity_id, "2");
    assert_eq!(e04.raw_external, "王小明/E04");
    assert!(mappings.iter().all(|m| m.external_id != "X99"));

    let records = h.engine.list_sync_records(TARGET, 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, SyncStatus::Success);
    assert_eq!(records[0].triggered_by, None);
    assert_eq!(records[0].entities_unmatched, 2);
}

#[tokio::test]
async fn fresh_target_is_skipped_without_a_record() {
    let h = harness().await;
    h.engine
        .trigger_sync(TARGET, SyncRequest::new(TriggerKind::Interactive))
        .await
        .unwrap();

    let again = h
        .engine
        .trigger_sync(TARGET, SyncRequest::new(TriggerKind::Periodic))
        .await
        .unwrap();
    assert!(matches!(
        again.status,
        SyncOutcomeStatus::Skipped(SkipReason::Fresh { .. })
    ));
    assert!(again.record_id.is_none());
    assert_eq!(h.engine.list_sync_records(TARGET, 10).await.unwrap().len(), 1);

    let status = h.engine.get_sync_status(TARGET).await.unwrap();
    assert!(status.last_synced_at.is_some());
    assert_eq!(status.status, Some(SyncStatus::Success));
    assert_eq!(status.rows_synced, 9);
    assert_eq!(status.entities_synced, 3);
    assert!(!status.in_progress);
}

#[tokio::test]
async fn forced_resync_of_unchanged_sheets_is_idempotent() {
    let h = harness().await;
    let first = h.engine.trigger_sync(TARGET, forced()).await.unwrap();
    let before = snapshot_rows(&h.store).await;

    let second = h.engine.trigger_sync(TARGET, forced()).await.unwrap();
    let after = snapshot_rows(&h.store).await;

    assert!(first.is_success() && second.is_success());
    assert_eq!(before, after);
    assert_eq!(after.len(), 9);
    assert_eq!(second.rows_affected, 0);
    assert_eq!(first.upstream_changed, None);
    assert_eq!(second.upstream_changed, Some(false));

    let records = h.engine.list_sync_records(TARGET, 10).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].triggered_by.as_deref(), Some("ops@example.test"));

    let status = h.engine.get_sync_status(TARGET).await.unwrap();
    assert_eq!(status.rows_synced, 9);
}

#[tokio::test]
async fn upstream_edits_replace_only_the_changed_cells() {
    let h = harness().await;
    h.engine.trigger_sync(TARGET, forced()).await.unwrap();

    h.source.set_sheet(
        RESULTS_DOC,
        RESULTS_TITLE,
        json!({"values": [
            ["員工(姓名/ID)", "2025/11/01", "2025/11/02", "2025/11/03"],
            ["陳大文/E01", "D", "E", ""],
            ["王小明/E04", "N", "休", "D"],
            ["林美華/E07", "小夜", "大夜", "A 櫃台人力"]
        ]}),
    );
    let outcome = h.engine.trigger_sync(TARGET, forced()).await.unwrap();
    assert_eq!(outcome.upstream_changed, Some(true));
    assert_eq!(outcome.rows_affected, 2);

    let chen = h.engine.get_cached_rows("1", TARGET, None).await.unwrap();
    assert_eq!(chen.len(), 2);
    let lin = h
        .engine
        .get_cached_rows("3", TARGET, Some(DateRange::new(d(2), d(2))))
        .await
        .unwrap();
    assert_eq!(lin[0].category, "N");
}

#[tokio::test]
async fn critical_sheet_failure_keeps_existing_rows() {
    let h = harness().await;
    h.engine.trigger_sync(TARGET, forced()).await.unwrap();
    let before = snapshot_rows(&h.store).await;

    h.source.remove_sheet(RESULTS_DOC, RESULTS_TITLE);
    let missing = h.engine.trigger_sync(TARGET, forced()).await.unwrap();
    assert_eq!(missing.status, SyncOutcomeStatus::Failed);
    let err = &missing.sheet_errors[0];
    assert_eq!(err.role, FINAL_OUTPUT);
    assert_eq!(err.kind, SheetErrorKind::SheetNotFound);
    assert!(err.critical);
    assert_eq!(snapshot_rows(&h.store).await, before);

    h.source.set_sheet(RESULTS_DOC, RESULTS_TITLE, json!({"values": "oops"}));
    let malformed = h.engine.trigger_sync(TARGET, forced()).await.unwrap();
    assert_eq!(malformed.status, SyncOutcomeStatus::Failed);
    assert_eq!(malformed.sheet_errors[0].kind, SheetErrorKind::MalformedData);
    assert_eq!(snapshot_rows(&h.store).await, before);

    let status = h.engine.get_sync_status(TARGET).await.unwrap();
    assert_eq!(status.status, Some(SyncStatus::Failed));
    assert!(status.last_synced_at.is_some());

    let records = h.engine.list_sync_records(TARGET, 10).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records[0].error.is_some());
    assert!(records[0].duration_ms.is_some());
}

#[tokio::test]
async fn transport_failure_is_not_retried() {
    let h = harness().await;
    h.source.fail_next(
        RESULTS_DOC,
        [
            SourceError::Transport {
                status: Some(500),
                message: "backend error".into(),
            },
            SourceError::RateLimited { retry_after: None },
        ],
    );
    let outcome = h.engine.trigger_sync(TARGET, forced()).await.unwrap();
    assert_eq!(outcome.status, SyncOutcomeStatus::Failed);
    assert_eq!(outcome.sheet_errors[0].kind, SheetErrorKind::Transport);

    // The queued rate limit is left for the next run, which absorbs it.
    let next = h.engine.trigger_sync(TARGET, forced()).await.unwrap();
    assert_eq!(next.status, SyncOutcomeStatus::Succeeded);
}

#[tokio::test]
async fn auxiliary_sheet_failure_degrades_but_syncs() {
    let h = harness().await;
    h.source.remove_sheet("demo-params", "班別定義表");

    let outcome = h.engine.trigger_sync(TARGET, forced()).await.unwrap();
    assert_eq!(outcome.status, SyncOutcomeStatus::Degraded);
    assert_eq!(outcome.sheet_errors.len(), 1);
    assert_eq!(outcome.sheet_errors[0].role, "shift_definitions");
    assert!(!outcome.sheet_errors[0].critical);
    assert_eq!(outcome.entities_synced, 3);

    let records = h.engine.list_sync_records(TARGET, 1).await.unwrap();
    assert_eq!(records[0].status, SyncStatus::Success);
    assert_eq!(records[0].sheet_errors.len(), 1);
}

#[tokio::test]
async fn exhausted_rate_limit_budget_falls_back_to_stale_read() {
    let mut config = test_config();
    config.cache.ttl = Duration::from_millis(1);
    let h = harness_with(config).await;
    h.engine.trigger_sync(TARGET, forced()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let limited = || (0..3).map(|_| SourceError::RateLimited { retry_after: None });
    h.source.fail_next(RESULTS_DOC, limited());
    let outcome = h.engine.trigger_sync(TARGET, forced()).await.unwrap();
    assert_eq!(outcome.status, SyncOutcomeStatus::Failed);
    assert_eq!(outcome.sheet_errors[0].kind, SheetErrorKind::RateLimited);

    h.source.fail_next(RESULTS_DOC, limited());
    let served = h.engine.read_sheet(TARGET, FINAL_OUTPUT).await.unwrap();
    assert!(served.stale);
    assert_eq!(served.snapshot.row_count(), 5);

    let fresh = h.engine.read_sheet(TARGET, FINAL_OUTPUT).await.unwrap();
    assert!(!fresh.stale);
}

#[tokio::test]
async fn read_without_any_cached_copy_reports_an_error() {
    let h = harness().await;
    h.source.fail_next(
        RESULTS_DOC,
        (0..3).map(|_| SourceError::RateLimited { retry_after: None }),
    );
    assert!(h.engine.read_sheet(TARGET, FINAL_OUTPUT).await.is_err());
    assert!(h.engine.read_sheet(TARGET, "no_such_role").await.is_err());

    let served = h.engine.read_sheet(TARGET, FINAL_OUTPUT).await.unwrap();
    assert!(!served.stale);
    assert_eq!(served.snapshot.sheet_name, RESULTS_TITLE);
}

#[tokio::test]
async fn concurrent_forced_syncs_do_not_duplicate_rows() {
    let h = harness().await;
    let (a, b) = tokio::join!(
        h.engine.trigger_sync(TARGET, forced()),
        h.engine.trigger_sync(TARGET, forced())
    );
    assert!(a.unwrap().is_success());
    assert!(b.unwrap().is_success());

    let rows = snapshot_rows(&h.store).await;
    let mut keys: Vec<_> = rows.iter().map(|(e, d, _, _)| (e.clone(), *d)).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), rows.len());
    assert_eq!(rows.len(), 9);
    assert_eq!(h.engine.list_mappings(TARGET).await.unwrap().len(), 3);
    assert_eq!(h.engine.list_sync_records(TARGET, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn unresolved_entities_keep_their_rows() {
    let h = harness().await;
    let range = DateRange::new(d(1), d(3));
    let manual = CachedRow {
        target_id: TARGET.into(),
        entity_id: "6".into(),
        date: d(2),
        category: "D".into(),
        value: "D".into(),
        updated_at: chrono::Utc::now(),
    };
    h.store
        .replace_rows(TARGET, range, &["6".to_string()], &[manual])
        .await
        .unwrap();

    let outcome = h.engine.trigger_sync(TARGET, forced()).await.unwrap();
    assert!(outcome.is_success());
    let zhao = h.engine.get_cached_rows("6", TARGET, None).await.unwrap();
    assert_eq!(zhao.len(), 1);
    assert!(h.engine.get_cached_rows("4", TARGET, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn explicit_mapping_resolves_an_unmatched_entity() {
    let h = harness().await;
    assert_eq!(
        h.engine.register_mapping(TARGET, "周杰／E12", "4").await.unwrap(),
        MappingWrite::Inserted
    );
    assert!(matches!(
        h.engine.register_mapping(TARGET, "E12", "6").await.unwrap(),
        MappingWrite::Conflict { .. }
    ));

    let outcome = h.engine.trigger_sync(TARGET, forced()).await.unwrap();
    assert_eq!(outcome.entities_synced, 4);
    let chou = h.engine.get_cached_rows("4", TARGET, None).await.unwrap();
    let cells: Vec<_> = chou.iter().map(|r| (r.date, r.category.as_str())).collect();
    assert_eq!(cells, vec![(d(1), "D"), (d(3), "N")]);
}

#[tokio::test]
async fn one_row_is_never_shared_by_two_entities() {
    let h = harness().await;
    // Two distinct mappings that both name the 周杰／E12 row.
    assert_eq!(
        h.engine.register_mapping(TARGET, "周杰", "4").await.unwrap(),
        MappingWrite::Inserted
    );
    assert_eq!(
        h.engine.register_mapping(TARGET, "E12", "6").await.unwrap(),
        MappingWrite::Inserted
    );

    let outcome = h.engine.trigger_sync(TARGET, forced()).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.entities_synced, 4);
    let refused = outcome.unmatched.iter().find(|r| r.entity_id == "6").unwrap();
    assert_eq!(refused.claimed_by.as_deref(), Some("4"));

    assert_eq!(h.engine.get_cached_rows("4", TARGET, None).await.unwrap().len(), 2);
    assert!(h.engine.get_cached_rows("6", TARGET, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn sync_all_and_unknown_targets() {
    let h = harness().await;
    let outcomes = h.engine.sync_all(TriggerKind::Auto).await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].0, TARGET);
    assert!(outcomes[0].1.as_ref().unwrap().is_success());

    let again = h.engine.sync_all(TriggerKind::Auto).await;
    assert!(again[0].1.as_ref().unwrap().is_skipped());

    assert!(h.engine.trigger_sync("nope", forced()).await.is_err());
    assert!(h.store.last_success(TARGET).await.unwrap().is_some());
}
