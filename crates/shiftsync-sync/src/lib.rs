//! Sync orchestration: identity reconciliation, freshness, persistence and scheduling.

use std::sync::Arc;

use anyhow::{Context, Result};
use shiftsync_adapters::{load_fixture_bundle, FixtureSheetSource};
use shiftsync_core::{InternalEntity, TriggerKind};
use shiftsync_storage::{FileSnapshotBackend, HttpSheetSource, SheetSource, SnapshotCache};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub mod config;
pub mod engine;
pub mod ledger;
pub mod pg;
pub mod resolver;
pub mod store;

pub use config::{ConfigError, FreshnessPolicy, SyncConfig, TargetConfig, TargetRegistry};
pub use engine::{
    ServedSnapshot, SyncEngine, SyncOutcome, SyncOutcomeStatus, SyncRequest, SyncStatusView,
};
pub use ledger::{FreshnessLedger, SkipReason, SuccessStats, SyncDecision};
pub use pg::PgStore;
pub use resolver::{IdentityResolver, NoMatchReport, Resolution};
pub use store::{MappingWrite, MemoryStore, SyncStore};

pub const CRATE_NAME: &str = "shiftsync-sync";

/// One engine per process plus the resources it owns.
pub struct SyncRuntime {
    config: SyncConfig,
    engine: Arc<SyncEngine>,
    pg: Option<Arc<PgStore>>,
    scheduler: Option<JobScheduler>,
}

impl SyncRuntime {
    pub async fn start(config: SyncConfig) -> Result<Self> {
        let registry = TargetRegistry::load(&config.targets_path)?;

        let bundle = match &config.fixtures_path {
            Some(path) => Some(load_fixture_bundle(path)?),
            None => None,
        };
        let source: Arc<dyn SheetSource> = match &bundle {
            Some(bundle) => {
                info!(fixture_id = %bundle.fixture_id, "serving sheets from fixture bundle");
                Arc::new(FixtureSheetSource::new(bundle))
            }
            None => Arc::new(HttpSheetSource::new(config.http.clone())?),
        };
        let fixture_entities = bundle.map(|b| b.entities).unwrap_or_default();

        let mut cache = SnapshotCache::new(config.cache);
        let (store, pg): (Arc<dyn SyncStore>, Option<Arc<PgStore>>) = match &config.database_url {
            Some(url) => {
                let pg = Arc::new(PgStore::connect(url).await?);
                pg.migrate().await?;
                for target in &registry.targets {
                    let seeded = pg
                        .seed_entities(&target.target_id, seed_for(target, &fixture_entities))
                        .await
                        .with_context(|| format!("seeding entities for {}", target.target_id))?;
                    if seeded > 0 {
                        info!(target_id = %target.target_id, seeded, "entity directory seeded");
                    }
                }
                cache = cache.with_backend(pg.clone());
                let store: Arc<dyn SyncStore> = pg.clone();
                (store, Some(pg))
            }
            None => {
                let memory = MemoryStore::new();
                for target in &registry.targets {
                    let entities = seed_for(target, &fixture_entities).to_vec();
                    memory.seed_entities(&target.target_id, entities).await;
                }
                if let Some(dir) = &config.snapshot_dir {
                    cache = cache.with_backend(Arc::new(FileSnapshotBackend::new(dir)));
                }
                warn!("DATABASE_URL not set; using in-memory storage");
                let store: Arc<dyn SyncStore> = Arc::new(memory);
                (store, None)
            }
        };

        let engine = Arc::new(SyncEngine::new(
            &config,
            registry,
            store,
            source,
            Arc::new(cache),
        ));
        info!(targets = engine.registry().targets.len(), "sync runtime started");
        Ok(Self {
            config,
            engine,
            pg,
            scheduler: None,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Starts the periodic scheduler if enabled. Returns whether it is running.
    pub async fn start_scheduler(&mut self) -> Result<bool> {
        if self.scheduler.is_some() {
            return Ok(true);
        }
        let Some(sched) = maybe_build_scheduler(&self.config, self.engine.clone()).await? else {
            return Ok(false);
        };
        sched.start().await.context("starting scheduler")?;
        info!(cron = %self.config.sync_cron, "periodic sync scheduled");
        self.scheduler = Some(sched);
        Ok(true)
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(mut sched) = self.scheduler.take() {
            sched.shutdown().await.context("stopping scheduler")?;
        }
        if let Some(pg) = &self.pg {
            pg.close().await;
        }
        info!("sync runtime stopped");
        Ok(())
    }
}

/// Seed entities of a target: its own list, else the fixture bundle's.
fn seed_for<'a>(target: &'a TargetConfig, fixture: &'a [InternalEntity]) -> &'a [InternalEntity] {
    if target.entities.is_empty() {
        fixture
    } else {
        &target.entities
    }
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    engine: Arc<SyncEngine>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let engine = engine.clone();
        Box::pin(async move {
            for (target_id, outcome) in engine.sync_all(TriggerKind::Periodic).await {
                if let Err(err) = outcome {
                    warn!(%target_id, error = %format!("{err:#}"), "periodic sync failed");
                }
            }
            engine.purge_expired_snapshots().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
