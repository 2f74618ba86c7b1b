//! Per-target sync orchestration: decide, fetch, resolve, replace, record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use shiftsync_adapters::{ScheduleGrid, SheetSpec, EMPLOYEE_ROSTER, FINAL_OUTPUT};
use shiftsync_core::{
    CacheKey, CachedRow, DateRange, IdentityMapping, SheetError, SheetErrorKind, SheetSnapshot,
    SyncCompletion, SyncRecord, SyncStatus, TriggerKind,
};
use shiftsync_storage::{FetchError, SheetFetcher, SheetSource, SnapshotCache};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{SyncConfig, TargetConfig, TargetRegistry};
use crate::ledger::{FreshnessLedger, SkipReason, SuccessStats, SyncDecision};
use crate::resolver::{Dataset, IdentityResolver, NoMatchReport, Resolution};
use crate::store::{MappingWrite, SyncStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub force: bool,
    pub trigger: TriggerKind,
    pub triggered_by: Option<String>,
}

impl SyncRequest {
    pub fn new(trigger: TriggerKind) -> Self {
        Self {
            force: false,
            trigger,
            triggered_by: None,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn by(mut self, who: impl Into<String>) -> Self {
        self.triggered_by = Some(who.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcomeStatus {
    Skipped(SkipReason),
    Succeeded,
    /// Succeeded, but one or more non-critical sheets failed.
    Degraded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub target_id: String,
    /// Id of the emitted sync record; `None` for skips.
    pub record_id: Option<Uuid>,
    pub status: SyncOutcomeStatus,
    pub rows_affected: u64,
    pub entities_synced: u64,
    pub entities_unmatched: u64,
    pub error: Option<String>,
    pub sheet_errors: Vec<SheetError>,
    pub replaced_range: Option<DateRange>,
    pub unmatched: Vec<NoMatchReport>,
    /// Whether the authoritative sheet differs from the previously cached copy.
    pub upstream_changed: Option<bool>,
}

impl SyncOutcome {
    fn skipped(target_id: &str, reason: SkipReason) -> Self {
        Self {
            target_id: target_id.to_string(),
            record_id: None,
            status: SyncOutcomeStatus::Skipped(reason),
            rows_affected: 0,
            entities_synced: 0,
            entities_unmatched: 0,
            error: None,
            sheet_errors: Vec::new(),
            replaced_range: None,
            unmatched: Vec::new(),
            upstream_changed: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            SyncOutcomeStatus::Succeeded | SyncOutcomeStatus::Degraded
        )
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, SyncOutcomeStatus::Skipped(_))
    }
}

/// What read paths show about a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatusView {
    pub target_id: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Status of the most recent attempt.
    pub status: Option<SyncStatus>,
    /// Cached rows currently held for the target.
    pub rows_synced: u64,
    pub entities_synced: u64,
    pub in_progress: bool,
}

/// A sheet served to a latency-sensitive caller.
#[derive(Debug, Clone)]
pub struct ServedSnapshot {
    pub snapshot: SheetSnapshot,
    /// Served from an expired cache entry because the live read failed.
    pub stale: bool,
}

struct RunReport {
    status: SyncStatus,
    rows_affected: u64,
    entities_synced: u64,
    entities_unmatched: u64,
    error: Option<String>,
    sheet_errors: Vec<SheetError>,
    range: Option<DateRange>,
    unmatched: Vec<NoMatchReport>,
    upstream_changed: Option<bool>,
}

impl RunReport {
    fn failed(error: impl Into<String>, sheet_errors: Vec<SheetError>) -> Self {
        Self {
            status: SyncStatus::Failed,
            rows_affected: 0,
            entities_synced: 0,
            entities_unmatched: 0,
            error: Some(error.into()),
            sheet_errors,
            range: None,
            unmatched: Vec::new(),
            upstream_changed: None,
        }
    }
}

struct LoadedSheet {
    snapshot: SheetSnapshot,
    changed: Option<bool>,
}

/// Releases a target's in-progress slot when a run ends, however it ends.
struct RunGuard<'a> {
    running: &'a Mutex<HashMap<String, usize>>,
    target_id: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = running.get_mut(&self.target_id) {
            *count -= 1;
            if *count == 0 {
                running.remove(&self.target_id);
            }
        }
    }
}

/// The process-wide sync service. Construct once and share behind an `Arc`.
pub struct SyncEngine {
    registry: TargetRegistry,
    store: Arc<dyn SyncStore>,
    cache: Arc<SnapshotCache>,
    fetcher: SheetFetcher,
    ledger: FreshnessLedger,
    resolver: IdentityResolver,
    read_deadline: Duration,
    running: Mutex<HashMap<String, usize>>,
}

impl SyncEngine {
    pub fn new(
        config: &SyncConfig,
        registry: TargetRegistry,
        store: Arc<dyn SyncStore>,
        source: Arc<dyn SheetSource>,
        cache: Arc<SnapshotCache>,
    ) -> Self {
        Self {
            fetcher: SheetFetcher::new(source, config.fetcher.clone()),
            ledger: FreshnessLedger::new(config.freshness, store.clone()),
            resolver: IdentityResolver::new(store.clone(), config.synthesized_id_prefix.clone()),
            read_deadline: config.read_deadline,
            running: Mutex::new(HashMap::new()),
            registry,
            store,
            cache,
        }
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    fn enter(&self, target_id: &str, force: bool) -> Option<RunGuard<'_>> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        let count = running.entry(target_id.to_string()).or_insert(0);
        if *count > 0 && !force {
            return None;
        }
        *count += 1;
        Some(RunGuard {
            running: &self.running,
            target_id: target_id.to_string(),
        })
    }

    fn is_running(&self, target_id: &str) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.get(target_id).is_some_and(|count| *count > 0)
    }

    /// Runs one sync of `target_id` unless the freshness policy or a concurrent run says skip.
    ///
    /// Sheet and persistence failures are reported in the outcome and its sync
    /// record. `Err` is returned only for an unknown target or when the record
    /// itself cannot be written.
    pub async fn trigger_sync(&self, target_id: &str, request: SyncRequest) -> Result<SyncOutcome> {
        let target = self.registry.get(target_id)?;

        if let SyncDecision::Skip(reason) = self
            .ledger
            .decide(target_id, request.trigger, request.force)
            .await?
        {
            info!(target_id, trigger = %request.trigger, ?reason, "sync skipped; target is fresh");
            return Ok(SyncOutcome::skipped(target_id, reason));
        }

        let Some(_guard) = self.enter(target_id, request.force) else {
            info!(target_id, trigger = %request.trigger, "sync skipped; already in progress");
            return Ok(SyncOutcome::skipped(target_id, SkipReason::AlreadyInProgress));
        };

        let mut record = SyncRecord::begin(
            target_id,
            request.trigger,
            request.triggered_by.clone(),
            Utc::now(),
        );
        let record_id = record.record_id;
        self.store
            .begin_record(&record)
            .await
            .context("recording sync start")?;

        let span = info_span!(
            "sync_run",
            run_id = %record_id,
            target_id,
            trigger = %request.trigger,
            force = request.force
        );
        async move {
            let report = match self.run(target, request.force).await {
                Ok(report) => report,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "sync aborted");
                    RunReport::failed(format!("{err:#}"), Vec::new())
                }
            };

            let finished_at = Utc::now();
            let completed = record.complete(SyncCompletion {
                status: report.status,
                finished_at,
                rows_affected: report.rows_affected,
                entities_synced: report.entities_synced,
                entities_unmatched: report.entities_unmatched,
                error: report.error.clone(),
                sheet_errors: report.sheet_errors.clone(),
            });
            if !completed {
                warn!(status = report.status.as_str(), "illegal sync record transition");
            }
            if !self
                .store
                .finish_record(&record)
                .await
                .context("recording sync outcome")?
            {
                warn!("sync record was already terminal");
            }

            if report.status == SyncStatus::Success {
                self.ledger
                    .record_success(
                        target_id,
                        finished_at,
                        SuccessStats {
                            rows_affected: report.rows_affected,
                            entities_synced: report.entities_synced,
                        },
                    )
                    .await;
            }

            let status = match (report.status, report.sheet_errors.is_empty()) {
                (SyncStatus::Success, true) => SyncOutcomeStatus::Succeeded,
                (SyncStatus::Success, false) => SyncOutcomeStatus::Degraded,
                _ => SyncOutcomeStatus::Failed,
            };
            info!(
                status = ?status,
                rows_affected = report.rows_affected,
                entities_synced = report.entities_synced,
                entities_unmatched = report.entities_unmatched,
                sheet_errors = report.sheet_errors.len(),
                duration_ms = record.duration_ms.unwrap_or_default(),
                "sync finished"
            );

            Ok(SyncOutcome {
                target_id: target_id.to_string(),
                record_id: Some(record_id),
                status,
                rows_affected: report.rows_affected,
                entities_synced: report.entities_synced,
                entities_unmatched: report.entities_unmatched,
                error: report.error,
                sheet_errors: report.sheet_errors,
                replaced_range: report.range,
                unmatched: report.unmatched,
                upstream_changed: report.upstream_changed,
            })
        }
        .instrument(span)
        .await
    }

    async fn run(&self, target: &TargetConfig, force: bool) -> Result<RunReport> {
        let mut sheet_errors: Vec<SheetError> = Vec::new();
        let mut sheets: HashMap<String, SheetSnapshot> = HashMap::new();
        let mut upstream_changed = None;

        for spec in target.sheet_specs() {
            let document_id = target.document_for(spec.slot);
            match self.load_sheet(document_id, &spec, force).await {
                Ok(loaded) if !loaded.snapshot.success => {
                    sheet_errors.push(SheetError {
                        role: spec.key.clone(),
                        kind: SheetErrorKind::MalformedData,
                        critical: spec.critical,
                        message: loaded
                            .snapshot
                            .error
                            .unwrap_or_else(|| "malformed payload".to_string()),
                    });
                }
                Ok(loaded) => {
                    if spec.key == FINAL_OUTPUT {
                        upstream_changed = loaded.changed;
                    }
                    sheets.insert(spec.key.clone(), loaded.snapshot);
                }
                Err(FetchError::SheetNotFound { .. }) if spec.optional => {
                    debug!(sheet = %spec.key, "optional sheet absent");
                }
                Err(err) => {
                    warn!(
                        sheet = %spec.key,
                        critical = spec.critical,
                        error = %err,
                        "sheet unavailable"
                    );
                    sheet_errors.push(SheetError {
                        role: spec.key.clone(),
                        kind: err.kind(),
                        critical: spec.critical,
                        message: err.to_string(),
                    });
                }
            }
        }

        if let Some(failed) = sheet_errors.iter().find(|e| e.critical) {
            let error = format!("critical sheet `{}` failed: {}", failed.role, failed.message);
            return Ok(RunReport::failed(error, sheet_errors));
        }

        let Some(results) = sheets.get(FINAL_OUTPUT) else {
            sheet_errors.push(SheetError {
                role: FINAL_OUTPUT.to_string(),
                kind: SheetErrorKind::SheetNotFound,
                critical: true,
                message: "final output sheet was not loaded".to_string(),
            });
            return Ok(RunReport::failed("final output sheet was not loaded", sheet_errors));
        };
        if let Some(changed) = upstream_changed {
            info!(changed, hash = %results.content_hash, "final output fingerprint compared");
        }

        let grid = match ScheduleGrid::from_snapshot(results) {
            Ok(grid) => grid,
            Err(err) => {
                sheet_errors.push(SheetError {
                    role: FINAL_OUTPUT.to_string(),
                    kind: SheetErrorKind::MalformedData,
                    critical: true,
                    message: err.to_string(),
                });
                return Ok(RunReport::failed(err.to_string(), sheet_errors));
            }
        };
        let Some(range) = grid.date_range() else {
            return Ok(RunReport::failed("final output has no dates", sheet_errors));
        };

        let authoritative = Dataset::authoritative(&grid.identifier_column, &grid.rows);
        let reference = sheets
            .get(EMPLOYEE_ROSTER)
            .and_then(|roster| Dataset::reference(&roster.columns, &roster.rows));
        if reference.is_none() {
            debug!("no usable roster; resolving against the final output only");
        }

        let scope = target.mapping_scope();
        let entities = self
            .store
            .list_entities(&target.target_id)
            .await
            .context("listing internal entities")?;

        let now = Utc::now();
        let mut resolved_ids: Vec<String> = Vec::new();
        let mut rows: Vec<CachedRow> = Vec::new();
        let mut unmatched: Vec<NoMatchReport> = Vec::new();
        let mut claimed: HashMap<usize, String> = HashMap::new();
        for entity in &entities {
            match self
                .resolver
                .resolve(scope, entity, reference.as_ref(), &authoritative)
                .await?
            {
                Resolution::Matched(found) => {
                    if let Some(owner) = claimed.get(&found.row_index) {
                        warn!(
                            entity_id = %entity.id,
                            owner = %owner,
                            row = found.row_index,
                            external_id = %found.external_id,
                            "sheet row already taken by another entity; leaving unresolved"
                        );
                        unmatched.push(NoMatchReport::row_claimed(&found, owner));
                        continue;
                    }
                    claimed.insert(found.row_index, entity.id.clone());
                    let row = &grid.rows[found.row_index];
                    rows.extend(grid.cells_for_row(row).into_iter().map(|cell| CachedRow {
                        target_id: target.target_id.clone(),
                        entity_id: entity.id.clone(),
                        date: cell.date,
                        category: cell.category.code().to_string(),
                        value: cell.value,
                        updated_at: now,
                    }));
                    resolved_ids.push(entity.id.clone());
                }
                Resolution::NoMatch(report) => unmatched.push(report),
            }
        }

        let stats = self
            .store
            .replace_rows(&target.target_id, range, &resolved_ids, &rows)
            .await
            .context("replacing cached rows")?;
        info!(
            start = %range.start,
            end = %range.end,
            inserted = stats.inserted,
            updated = stats.updated,
            unchanged = stats.unchanged,
            deleted = stats.deleted,
            "cached rows replaced"
        );
        if !unmatched.is_empty() {
            warn!(count = unmatched.len(), "entities without a sheet row were left untouched");
        }

        Ok(RunReport {
            status: SyncStatus::Success,
            rows_affected: stats.affected(),
            entities_synced: resolved_ids.len() as u64,
            entities_unmatched: unmatched.len() as u64,
            error: None,
            sheet_errors,
            range: Some(range),
            unmatched,
            upstream_changed,
        })
    }

    /// Fresh cache entry, else a live fetch written back to the cache. Never stale.
    async fn load_sheet(
        &self,
        document_id: &str,
        spec: &SheetSpec,
        force: bool,
    ) -> Result<LoadedSheet, FetchError> {
        let key = CacheKey::new(document_id, spec.key.as_str());
        if !force {
            if let Some(snapshot) = self.cache.get(&key).await {
                return Ok(LoadedSheet {
                    snapshot,
                    changed: None,
                });
            }
        }

        let previous = self.cache.content_hash(&key).await;
        let snapshot = self.fetcher.fetch(document_id, &spec.aliases).await?;
        let changed = previous.map(|hash| hash != snapshot.content_hash);
        if snapshot.success {
            self.cache
                .put(key, snapshot.clone(), self.cache.default_ttl())
                .await;
        }
        Ok(LoadedSheet { snapshot, changed })
    }

    /// Syncs every enabled target in parallel, each under its own freshness decision.
    pub async fn sync_all(
        self: &Arc<Self>,
        trigger: TriggerKind,
    ) -> Vec<(String, Result<SyncOutcome>)> {
        let mut tasks = JoinSet::new();
        for target in self.registry.enabled() {
            let engine = Arc::clone(self);
            let target_id = target.target_id.clone();
            tasks.spawn(async move {
                let outcome = engine
                    .trigger_sync(&target_id, SyncRequest::new(trigger))
                    .await;
                (target_id, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => outcomes.push(result),
                Err(err) => warn!(error = %err, "sync task did not complete"),
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    pub async fn get_cached_rows(
        &self,
        entity_id: &str,
        target_id: &str,
        range: Option<DateRange>,
    ) -> Result<Vec<CachedRow>> {
        self.registry.get(target_id)?;
        self.store.query_rows(target_id, Some(entity_id), range).await
    }

    pub async fn get_sync_status(&self, target_id: &str) -> Result<SyncStatusView> {
        self.registry.get(target_id)?;
        let latest = self.store.list_records(target_id, 1).await?;
        let last_success = self.ledger.entry(target_id).await?;
        let cached = self.store.query_rows(target_id, None, None).await?;
        Ok(SyncStatusView {
            target_id: target_id.to_string(),
            last_synced_at: last_success.map(|e| e.at),
            status: latest.first().map(|r| r.status),
            rows_synced: cached.len() as u64,
            entities_synced: last_success.map(|e| e.stats.entities_synced).unwrap_or_default(),
            in_progress: self.is_running(target_id),
        })
    }

    /// Drops sheet snapshots past their stale retention. Returns how many went.
    pub async fn purge_expired_snapshots(&self) -> u64 {
        let purged = self.cache.purge_expired(Utc::now()).await;
        if purged > 0 {
            info!(purged, "expired sheet snapshots purged");
        }
        purged
    }

    pub async fn list_sync_records(
        &self,
        target_id: &str,
        limit: usize,
    ) -> Result<Vec<SyncRecord>> {
        self.store.list_records(target_id, limit).await
    }

    /// Serves one sheet of a target within the read deadline.
    ///
    /// Order: fresh cache entry, live fetch, then the last cached copy flagged
    /// stale. Errors only when no copy was ever cached.
    pub async fn read_sheet(&self, target_id: &str, role: &str) -> Result<ServedSnapshot> {
        let target = self.registry.get(target_id)?;
        let Some(spec) = target.sheet_specs().into_iter().find(|s| s.key == role) else {
            bail!("target `{target_id}` has no sheet role `{role}`");
        };
        let document_id = target.document_for(spec.slot);
        let key = CacheKey::new(document_id, spec.key.as_str());

        if let Some(snapshot) = self.cache.get(&key).await {
            return Ok(ServedSnapshot {
                snapshot,
                stale: false,
            });
        }

        let failure = match tokio::time::timeout(
            self.read_deadline,
            self.fetcher.fetch(document_id, &spec.aliases),
        )
        .await
        {
            Ok(Ok(snapshot)) if snapshot.success => {
                self.cache
                    .put(key, snapshot.clone(), self.cache.default_ttl())
                    .await;
                return Ok(ServedSnapshot {
                    snapshot,
                    stale: false,
                });
            }
            Ok(Ok(snapshot)) => {
                let reason = snapshot.error.clone().unwrap_or_default();
                if let Some(stale) = self.cache.get_stale(&key).await {
                    warn!(%key, %reason, "malformed live read; serving stale copy");
                    return Ok(ServedSnapshot {
                        snapshot: stale,
                        stale: true,
                    });
                }
                return Ok(ServedSnapshot {
                    snapshot,
                    stale: false,
                });
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("read deadline of {:?} elapsed", self.read_deadline),
        };

        match self.cache.get_stale(&key).await {
            Some(snapshot) => {
                warn!(%key, reason = %failure, "live read failed; serving stale copy");
                Ok(ServedSnapshot {
                    snapshot,
                    stale: true,
                })
            }
            None => bail!("no cached copy of `{role}` for `{target_id}`: {failure}"),
        }
    }

    /// Operator-supplied identity mapping for a target's scope.
    pub async fn register_mapping(
        &self,
        target_id: &str,
        raw_external: &str,
        entity_id: &str,
    ) -> Result<MappingWrite> {
        let target = self.registry.get(target_id)?;
        self.resolver
            .register_explicit(target.mapping_scope(), raw_external, entity_id)
            .await
    }

    pub async fn list_mappings(&self, target_id: &str) -> Result<Vec<IdentityMapping>> {
        let target = self.registry.get(target_id)?;
        self.store.list_mappings(target.mapping_scope()).await
    }
}
