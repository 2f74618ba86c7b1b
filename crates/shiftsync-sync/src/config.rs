//! Runtime configuration and the sync target registry.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use shiftsync_adapters::{
    apply_sheet_overrides, default_sheet_specs, DocumentSlot, SheetOverride, SheetSpec,
};
use shiftsync_core::{InternalEntity, TriggerKind};
use shiftsync_storage::{
    BackoffPolicy, CachePolicy, FetcherConfig, HttpClientConfig, QuotaWindow, SheetCredentials,
    DEFAULT_SHEETS_API_BASE,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("sync target `{0}` is not registered")]
    UnknownTarget(String),
    #[error("sync target `{0}` is registered more than once")]
    DuplicateTarget(String),
}

/// Minimum interval between successful syncs, per trigger class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub interactive: Duration,
    pub periodic: Duration,
    pub auto: Duration,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            interactive: Duration::from_secs(30 * 60),
            periodic: Duration::from_secs(24 * 3600),
            auto: Duration::from_secs(6 * 3600),
        }
    }
}

impl FreshnessPolicy {
    pub fn min_interval(&self, trigger: TriggerKind) -> Duration {
        match trigger {
            TriggerKind::Interactive => self.interactive,
            TriggerKind::Periodic => self.periodic,
            TriggerKind::Auto => self.auto,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Postgres connection string; in-memory storage when absent.
    pub database_url: Option<String>,
    pub targets_path: PathBuf,
    /// Fixture bundle served instead of the live spreadsheet API.
    pub fixtures_path: Option<PathBuf>,
    /// Directory for file-backed stale snapshots when no database is configured.
    pub snapshot_dir: Option<PathBuf>,
    pub cache: CachePolicy,
    pub freshness: FreshnessPolicy,
    /// Overall deadline for a latency-sensitive sheet read.
    pub read_deadline: Duration,
    pub fetcher: FetcherConfig,
    pub http: HttpClientConfig,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    /// Prefix of the synthesized `<prefix><id>` identifier candidate.
    pub synthesized_id_prefix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            targets_path: PathBuf::from("targets.yaml"),
            fixtures_path: None,
            snapshot_dir: None,
            cache: CachePolicy::default(),
            freshness: FreshnessPolicy::default(),
            read_deadline: Duration::from_secs(20),
            fetcher: FetcherConfig::default(),
            http: HttpClientConfig::default(),
            scheduler_enabled: false,
            sync_cron: "0 0 0 * * *".to_string(),
            synthesized_id_prefix: "EMP-".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        config.database_url = get("DATABASE_URL");
        if let Some(path) = get("SHIFTSYNC_TARGETS") {
            config.targets_path = PathBuf::from(path);
        }
        config.fixtures_path = get("SHIFTSYNC_FIXTURES").map(PathBuf::from);
        config.snapshot_dir = get("SHIFTSYNC_SNAPSHOT_DIR").map(PathBuf::from);

        if let Some(secs) = parse_u64(&get, "SHIFTSYNC_CACHE_TTL_SECS")? {
            config.cache.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&get, "SHIFTSYNC_STALE_RETENTION_SECS")? {
            config.cache.stale_retention = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&get, "SHIFTSYNC_FRESHNESS_INTERACTIVE_SECS")? {
            config.freshness.interactive = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&get, "SHIFTSYNC_FRESHNESS_PERIODIC_SECS")? {
            config.freshness.periodic = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&get, "SHIFTSYNC_FRESHNESS_AUTO_SECS")? {
            config.freshness.auto = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&get, "SHIFTSYNC_READ_DEADLINE_SECS")? {
            config.read_deadline = Duration::from_secs(secs);
        }

        let mut backoff = BackoffPolicy::default();
        if let Some(attempts) = parse_u64(&get, "SHIFTSYNC_RETRY_ATTEMPTS")? {
            if attempts == 0 {
                return Err(ConfigError::InvalidValue {
                    var: "SHIFTSYNC_RETRY_ATTEMPTS",
                    value: attempts.to_string(),
                    reason: "at least one attempt is required".into(),
                });
            }
            backoff.max_attempts = attempts as usize;
        }
        if let Some(ms) = parse_u64(&get, "SHIFTSYNC_RETRY_BASE_MS")? {
            backoff.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&get, "SHIFTSYNC_RETRY_MAX_MS")? {
            backoff.max_delay = Duration::from_millis(ms);
        }
        config.fetcher.backoff = backoff;

        if let Some(n) = parse_u64(&get, "SHIFTSYNC_HTTP_CONCURRENCY")? {
            config.fetcher.concurrency = n.max(1) as usize;
        }
        if let Some(requests) = parse_u64(&get, "SHIFTSYNC_QUOTA_REQUESTS")? {
            let window_secs = parse_u64(&get, "SHIFTSYNC_QUOTA_WINDOW_SECS")?.unwrap_or(60);
            config.fetcher.quota = Some(QuotaWindow {
                requests: requests.clamp(1, u32::MAX as u64) as u32,
                window: Duration::from_secs(window_secs.max(1)),
            });
        }

        if let Some(secs) = parse_u64(&get, "SHIFTSYNC_HTTP_TIMEOUT_SECS")? {
            config.http.timeout = Duration::from_secs(secs);
        }
        config.http.base_url =
            get("SHIFTSYNC_SHEETS_API_BASE").unwrap_or_else(|| DEFAULT_SHEETS_API_BASE.to_string());
        config.http.user_agent = Some(
            get("SHIFTSYNC_USER_AGENT")
                .unwrap_or_else(|| format!("shiftsync/{}", env!("CARGO_PKG_VERSION"))),
        );
        config.http.credentials = match (get("SHIFTSYNC_BEARER_TOKEN"), get("SHIFTSYNC_API_KEY")) {
            (Some(token), _) => SheetCredentials::Bearer(token),
            (None, Some(key)) => SheetCredentials::ApiKey(key),
            (None, None) => SheetCredentials::Anonymous,
        };

        config.scheduler_enabled = get("SHIFTSYNC_SCHEDULER_ENABLED")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
            .unwrap_or(false);
        if let Some(cron) = get("SHIFTSYNC_SYNC_CRON") {
            config.sync_cron = cron;
        }
        if let Some(prefix) = get("SHIFTSYNC_ID_PREFIX") {
            config.synthesized_id_prefix = prefix;
        }

        Ok(config)
    }
}

fn parse_u64(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(value) = get(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            var,
            value,
            reason: err.to_string(),
        })
}

fn default_true() -> bool {
    true
}

/// One logical sync grouping, e.g. a monthly schedule definition.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub target_id: String,
    #[serde(default)]
    pub tenant: Option<String>,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub parameters_document: String,
    pub results_document: String,
    #[serde(default)]
    pub sheets: BTreeMap<String, SheetOverride>,
    /// Seed entities for in-memory storage.
    #[serde(default)]
    pub entities: Vec<InternalEntity>,
}

impl TargetConfig {
    pub fn sheet_specs(&self) -> Vec<SheetSpec> {
        apply_sheet_overrides(default_sheet_specs(), &self.sheets)
    }

    /// Identity mappings are shared by every target of the same tenant.
    pub fn mapping_scope(&self) -> &str {
        self.tenant.as_deref().unwrap_or(&self.target_id)
    }

    pub fn document_for(&self, slot: DocumentSlot) -> &str {
        match slot {
            DocumentSlot::Parameters => &self.parameters_document,
            DocumentSlot::Results => &self.results_document,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetRegistry {
    pub targets: Vec<TargetConfig>,
}

impl TargetRegistry {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing target registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for target in &self.targets {
            if !seen.insert(target.target_id.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.target_id.clone()));
            }
        }
        Ok(())
    }

    pub fn get(&self, target_id: &str) -> Result<&TargetConfig, ConfigError> {
        self.targets
            .iter()
            .find(|t| t.target_id == target_id)
            .ok_or_else(|| ConfigError::UnknownTarget(target_id.to_string()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &TargetConfig> {
        self.targets.iter().filter(|t| t.enabled)
    }
}
