//! Spreadsheet fetch utilities, snapshot caching and durable snapshot storage for shiftsync.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use shiftsync_core::{
    normalize_sheet_name, CacheEntry, CacheKey, RowMap, SheetErrorKind, SheetSnapshot,
};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shiftsync-storage";

pub const DEFAULT_SHEETS_API_BASE: &str = "https://sheets.googleapis.com/";

/// Failure reported by the raw spreadsheet transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("rate limited by spreadsheet source")]
    RateLimited { retry_after: Option<Duration> },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transport failure (status {status:?}): {message}")]
    Transport { status: Option<u16>, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl SourceError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::RateLimited { .. } => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

/// Only rate-limit responses are worth retrying; every other status is final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Raw read access to a spreadsheet document.
#[async_trait]
pub trait SheetSource: Send + Sync {
    /// Titles of every tab in the document.
    async fn list_sheets(&self, document_id: &str) -> Result<Vec<String>, SourceError>;

    /// Raw cell payload of one tab, exactly as the source returned it.
    async fn read_values(&self, document_id: &str, sheet_title: &str)
        -> Result<JsonValue, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Delay before retry `attempt_index`, stretched to a server `Retry-After` hint
    /// but never past `max_delay`.
    pub fn retry_delay(&self, attempt_index: usize, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        match retry_after {
            Some(hint) => delay.max(hint).min(self.max_delay),
            None => delay,
        }
    }

    /// Upper bound on time spent sleeping across one retry loop.
    pub fn max_total_delay(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.delay_for_attempt(attempt))
            .sum()
    }
}

/// Request quota of the spreadsheet source, e.g. 60 reads per 60 seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaWindow {
    pub requests: u32,
    pub window: Duration,
}

impl QuotaWindow {
    /// Steady-state spacing between calls once the burst allowance is spent.
    pub fn interval(&self) -> Duration {
        self.window / self.requests.max(1)
    }

    /// One cell replenished per interval, a full window's worth of burst.
    fn governor_quota(self) -> Quota {
        let burst = NonZeroU32::new(self.requests).unwrap_or(NonZeroU32::MIN);
        Quota::with_period(self.interval().max(Duration::from_nanos(1)))
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst)
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Paces outbound calls so one fetcher stays inside the source quota window.
///
/// A full window of requests may go out back to back; after that each call
/// waits for its slot, one slot per [`QuotaWindow::interval`].
pub struct QuotaPacer {
    quota: QuotaWindow,
    limiter: DirectLimiter,
}

impl QuotaPacer {
    pub fn new(quota: QuotaWindow) -> Self {
        Self {
            quota,
            limiter: RateLimiter::direct(quota.governor_quota()),
        }
    }

    pub async fn acquire(&self) {
        if self.limiter.check().is_ok() {
            return;
        }
        debug!(
            requests = self.quota.requests,
            window_secs = self.quota.window.as_secs(),
            "pacing call to source quota"
        );
        self.limiter.until_ready().await;
    }
}

#[derive(Debug, Clone)]
pub enum SheetCredentials {
    Anonymous,
    ApiKey(String),
    Bearer(String),
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub credentials: SheetCredentials,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SHEETS_API_BASE.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            credentials: SheetCredentials::Anonymous,
        }
    }
}

/// Google Sheets v4 values API over reqwest.
#[derive(Debug)]
pub struct HttpSheetSource {
    client: reqwest::Client,
    base_url: Url,
    credentials: SheetCredentials,
}

impl HttpSheetSource {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("parsing sheets api base url {}", config.base_url))?;

        Ok(Self {
            client,
            base_url,
            credentials: config.credentials,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::Transport {
                status: None,
                message: format!("base url {} cannot carry a path", self.base_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json(&self, url: Url, query: &[(&str, &str)]) -> Result<JsonValue, SourceError> {
        let mut request = self.client.get(url.clone()).query(query);
        match &self.credentials {
            SheetCredentials::Anonymous => {}
            SheetCredentials::ApiKey(key) => request = request.query(&[("key", key.as_str())]),
            SheetCredentials::Bearer(token) => request = request.bearer_auth(token),
        }

        let response = request.send().await.map_err(|err| SourceError::Transport {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<JsonValue>()
                .await
                .map_err(|err| SourceError::Malformed(err.to_string()));
        }

        if classify_status(status) == RetryDisposition::Retryable {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(SourceError::RateLimited { retry_after });
        }

        if status == StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound(url.path().to_string()));
        }

        Err(SourceError::Transport {
            status: Some(status.as_u16()),
            message: format!("http status {status} for {}", url.path()),
        })
    }
}

#[async_trait]
impl SheetSource for HttpSheetSource {
    async fn list_sheets(&self, document_id: &str) -> Result<Vec<String>, SourceError> {
        let url = self.endpoint(&["v4", "spreadsheets", document_id])?;
        let body = self
            .get_json(url, &[("fields", "sheets.properties.title")])
            .await?;
        let titles = body
            .get("sheets")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| SourceError::Malformed("spreadsheet metadata without `sheets`".into()))?
            .iter()
            .filter_map(|sheet| sheet.pointer("/properties/title").and_then(JsonValue::as_str))
            .map(str::to_string)
            .collect();
        Ok(titles)
    }

    async fn read_values(
        &self,
        document_id: &str,
        sheet_title: &str,
    ) -> Result<JsonValue, SourceError> {
        let range = format!("'{}'", sheet_title.replace('\'', "''"));
        let url = self.endpoint(&["v4", "spreadsheets", document_id, "values", &range])?;
        self.get_json(
            url,
            &[
                ("majorDimension", "ROWS"),
                ("valueRenderOption", "FORMATTED_VALUE"),
            ],
        )
        .await
    }
}

/// Rows recovered from a raw payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoercedRows {
    pub columns: Vec<String>,
    pub rows: Vec<RowMap>,
    /// Entries dropped because they were not rows.
    pub discarded: usize,
    /// Set when the payload as a whole could not be read as a table.
    pub malformed: Option<String>,
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Turns a source payload into a proper sequence of field maps.
///
/// Accepts the values-API envelope (`{"values": [[header...], [row...]]}`), a bare
/// header-first grid, or an array of objects. Anything that is not a row is dropped;
/// a payload with no table shape at all yields zero rows and a `malformed` reason.
pub fn coerce_rows(payload: &JsonValue) -> CoercedRows {
    let grid = match payload {
        JsonValue::Object(map) => match map.get("values") {
            Some(values) => values,
            // Sheets omits `values` entirely for an empty tab.
            None if map.contains_key("range") => return CoercedRows::default(),
            None => {
                return CoercedRows {
                    malformed: Some("object payload without `values`".into()),
                    ..Default::default()
                }
            }
        },
        other => other,
    };

    let Some(items) = grid.as_array() else {
        return CoercedRows {
            malformed: Some(format!("expected an array of rows, got {}", json_kind(grid))),
            ..Default::default()
        };
    };

    let Some(first) = items.first() else {
        return CoercedRows::default();
    };

    if let Some(header) = first.as_array() {
        let header: Vec<(usize, String)> = header
            .iter()
            .enumerate()
            .map(|(idx, cell)| (idx, cell_text(cell).trim().to_string()))
            .filter(|(_, name)| !name.is_empty())
            .collect();
        let columns = header.iter().map(|(_, name)| name.clone()).collect();
        let mut out = CoercedRows {
            columns,
            ..Default::default()
        };
        for item in &items[1..] {
            let Some(cells) = item.as_array() else {
                out.discarded += 1;
                continue;
            };
            let row: RowMap = header
                .iter()
                .map(|(idx, name)| {
                    let text = cells.get(*idx).map(cell_text).unwrap_or_default();
                    (name.clone(), text)
                })
                .collect();
            if row.values().any(|v| !v.trim().is_empty()) {
                out.rows.push(row);
            }
        }
        return out;
    }

    let mut out = CoercedRows::default();
    for item in items {
        let Some(object) = item.as_object() else {
            out.discarded += 1;
            continue;
        };
        for key in object.keys() {
            if !out.columns.contains(key) {
                out.columns.push(key.clone());
            }
        }
        let row: RowMap = object
            .iter()
            .map(|(k, v)| (k.clone(), cell_text(v)))
            .collect();
        if !row.is_empty() {
            out.rows.push(row);
        }
    }
    out
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// First candidate (in order) whose normalized form equals a normalized available title.
///
/// Returns `(alias, actual_title)`.
pub fn resolve_sheet_name(available: &[String], candidates: &[String]) -> Option<(String, String)> {
    candidates.iter().find_map(|alias| {
        let wanted = normalize_sheet_name(alias);
        if wanted.is_empty() {
            return None;
        }
        available
            .iter()
            .find(|title| normalize_sheet_name(title) == wanted)
            .map(|title| (alias.clone(), title.clone()))
    })
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("rate limited on {document_id} after {attempts} attempts")]
    RateLimited { document_id: String, attempts: usize },
    #[error("none of {candidates:?} found in {document_id} (available: {available:?})")]
    SheetNotFound {
        document_id: String,
        candidates: Vec<String>,
        available: Vec<String>,
    },
    #[error("transport failure on {document_id} (status {status:?}): {message}")]
    Transport {
        document_id: String,
        status: Option<u16>,
        message: String,
    },
    /// The document answered, but its sheet listing could not be read.
    #[error("malformed sheet listing for {document_id}: {message}")]
    Malformed { document_id: String, message: String },
}

impl FetchError {
    pub fn kind(&self) -> SheetErrorKind {
        match self {
            Self::RateLimited { .. } => SheetErrorKind::RateLimited,
            Self::SheetNotFound { .. } => SheetErrorKind::SheetNotFound,
            Self::Transport { .. } => SheetErrorKind::Transport,
            Self::Malformed { .. } => SheetErrorKind::MalformedData,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub backoff: BackoffPolicy,
    pub concurrency: usize,
    pub quota: Option<QuotaWindow>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            concurrency: 4,
            quota: None,
        }
    }
}

/// Resolves a sheet by alias and reads it, absorbing rate limits within a fixed budget.
///
/// Never writes to a cache; callers decide caching policy.
pub struct SheetFetcher {
    source: Arc<dyn SheetSource>,
    limit: Arc<Semaphore>,
    pacer: Option<QuotaPacer>,
    backoff: BackoffPolicy,
}

impl SheetFetcher {
    pub fn new(source: Arc<dyn SheetSource>, config: FetcherConfig) -> Self {
        Self {
            source,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            pacer: config.quota.map(QuotaPacer::new),
            backoff: config.backoff,
        }
    }

    pub async fn fetch(
        &self,
        document_id: &str,
        candidates: &[String],
    ) -> Result<SheetSnapshot, FetchError> {
        let span = info_span!("sheet_fetch", document_id, candidates = ?candidates);
        async {
            let available = self
                .with_retry(document_id, || self.source.list_sheets(document_id))
                .await
                .map_err(|err| match err {
                    Retried::Exhausted { attempts } => FetchError::RateLimited {
                        document_id: document_id.to_string(),
                        attempts,
                    },
                    Retried::Failed(SourceError::Malformed(reason)) => {
                        warn!(%reason, "malformed sheet listing");
                        FetchError::Malformed {
                            document_id: document_id.to_string(),
                            message: reason,
                        }
                    }
                    Retried::Failed(err) => transport(document_id, err),
                })?;

            let Some((alias, title)) = resolve_sheet_name(&available, candidates) else {
                warn!(?available, "no sheet alias matched");
                return Err(FetchError::SheetNotFound {
                    document_id: document_id.to_string(),
                    candidates: candidates.to_vec(),
                    available,
                });
            };
            if alias != title {
                debug!(alias = %alias, title = %title, "sheet resolved through normalization");
            }

            let payload = self
                .with_retry(document_id, || self.source.read_values(document_id, &title))
                .await;
            let fetched_at = Utc::now();

            let payload = match payload {
                Ok(payload) => payload,
                Err(Retried::Exhausted { attempts }) => {
                    return Err(FetchError::RateLimited {
                        document_id: document_id.to_string(),
                        attempts,
                    })
                }
                Err(Retried::Failed(SourceError::NotFound(_))) => {
                    return Err(FetchError::SheetNotFound {
                        document_id: document_id.to_string(),
                        candidates: candidates.to_vec(),
                        available,
                    })
                }
                Err(Retried::Failed(SourceError::Malformed(reason))) => {
                    warn!(sheet = %title, %reason, "malformed sheet payload coerced to empty");
                    return Ok(SheetSnapshot::malformed(
                        document_id,
                        title,
                        alias,
                        fetched_at,
                        reason,
                    ));
                }
                Err(Retried::Failed(err)) => return Err(transport(document_id, err)),
            };

            let coerced = coerce_rows(&payload);
            if coerced.discarded > 0 {
                warn!(sheet = %title, discarded = coerced.discarded, "dropped non-row entries");
            }
            if let Some(reason) = coerced.malformed {
                warn!(sheet = %title, %reason, "malformed sheet payload coerced to empty");
                return Ok(SheetSnapshot::malformed(
                    document_id,
                    title,
                    alias,
                    fetched_at,
                    reason,
                ));
            }

            info!(sheet = %title, rows = coerced.rows.len(), "sheet fetched");
            Ok(SheetSnapshot::new(
                document_id,
                title,
                alias,
                coerced.columns,
                coerced.rows,
                fetched_at,
            ))
        }
        .instrument(span)
        .await
    }

    async fn with_retry<T, F, Fut>(&self, document_id: &str, mut call: F) -> Result<T, Retried>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let attempts = self.backoff.max_attempts.max(1);
        for attempt in 0..attempts {
            let result = {
                let _permit = self
                    .limit
                    .acquire()
                    .await
                    .map_err(|_| Retried::Failed(SourceError::Transport {
                        status: None,
                        message: "fetcher shut down".into(),
                    }))?;
                if let Some(pacer) = &self.pacer {
                    pacer.acquire().await;
                }
                call().await
            };

            match result {
                Ok(value) => {
                    if attempt > 0 {
                        info!(document_id, attempt, "succeeded after rate-limit retries");
                    }
                    return Ok(value);
                }
                Err(err) if err.disposition() == RetryDisposition::Retryable => {
                    if attempt + 1 >= attempts {
                        warn!(document_id, attempts, "rate-limit retry budget exhausted");
                        return Err(Retried::Exhausted { attempts });
                    }
                    let retry_after = match err {
                        SourceError::RateLimited { retry_after } => retry_after,
                        _ => None,
                    };
                    let delay = self.backoff.retry_delay(attempt, retry_after);
                    warn!(
                        document_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(Retried::Failed(err)),
            }
        }
        Err(Retried::Exhausted { attempts })
    }
}

enum Retried {
    Exhausted { attempts: usize },
    Failed(SourceError),
}

fn transport(document_id: &str, err: SourceError) -> FetchError {
    let status = match &err {
        SourceError::Transport { status, .. } => *status,
        SourceError::NotFound(_) => Some(404),
        _ => None,
    };
    FetchError::Transport {
        document_id: document_id.to_string(),
        status,
        message: err.to_string(),
    }
}

/// Durable home for cache entries, consulted when the in-process cache has nothing.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    async fn save(&self, entry: &CacheEntry) -> anyhow::Result<()>;
    async fn load(&self, key: &CacheKey) -> anyhow::Result<Option<CacheEntry>>;
    /// Deletes entries that expired before `cutoff`. Returns how many were removed.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;
}

/// Cache entries as JSON files under a root directory, replaced by atomic rename.
#[derive(Debug, Clone)]
pub struct FileSnapshotBackend {
    root: PathBuf,
}

impl FileSnapshotBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn entry_relative_path(&self, key: &CacheKey) -> PathBuf {
        let document = Self::sha256_hex(key.document_id.as_bytes());
        let sheet = Self::sha256_hex(key.sheet_key.as_bytes());
        PathBuf::from(&document[..16]).join(format!("{}.json", &sheet[..16]))
    }

    async fn write_atomic(&self, absolute_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = absolute_path
            .parent()
            .with_context(|| format!("snapshot path {} has no parent", absolute_path.display()))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotBackend for FileSnapshotBackend {
    async fn save(&self, entry: &CacheEntry) -> anyhow::Result<()> {
        let path = self.root.join(self.entry_relative_path(&entry.key));
        let bytes = serde_json::to_vec(entry).context("serializing cache entry")?;
        self.write_atomic(&path, &bytes).await
    }

    async fn load(&self, key: &CacheKey) -> anyhow::Result<Option<CacheEntry>> {
        let path = self.root.join(self.entry_relative_path(key));
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading snapshot {}", path.display()))
            }
        };
        let entry: CacheEntry = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing snapshot {}", path.display()))?;
        Ok((entry.key == *key).then_some(entry))
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut documents = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("listing snapshots in {}", self.root.display()))
            }
        };
        let mut removed = 0;
        while let Some(document) = documents.next_entry().await? {
            if !document.file_type().await?.is_dir() {
                continue;
            }
            let mut sheets = fs::read_dir(document.path()).await?;
            while let Some(sheet) = sheets.next_entry().await? {
                let path = sheet.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }
                let bytes = fs::read(&path)
                    .await
                    .with_context(|| format!("reading snapshot {}", path.display()))?;
                let expires_at = match serde_json::from_slice::<CacheEntry>(&bytes) {
                    Ok(entry) => entry.expires_at,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "skipping unreadable snapshot");
                        continue;
                    }
                };
                if expires_at < cutoff {
                    fs::remove_file(&path)
                        .await
                        .with_context(|| format!("removing snapshot {}", path.display()))?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub ttl: Duration,
    /// How long past expiry an entry stays available to stale reads.
    pub stale_retention: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            stale_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

fn chrono_span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Keyed snapshot cache with expiry and a stale-read path.
///
/// `get` never serves an entry past `expires_at`. Expired entries are kept for
/// `get_stale` until the stale retention window passes, then purged lazily.
pub struct SnapshotCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    policy: CachePolicy,
    backend: Option<Arc<dyn SnapshotBackend>>,
}

impl SnapshotCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
            backend: None,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn SnapshotBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.policy.ttl
    }

    fn is_purgeable(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now > entry.expires_at + chrono_span(self.policy.stale_retention)
    }

    pub async fn get(&self, key: &CacheKey) -> Option<SheetSnapshot> {
        self.get_at(key, Utc::now()).await
    }

    pub async fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<SheetSnapshot> {
        let cached = self.entries.read().await.get(key).cloned();
        let entry = match cached {
            Some(entry) => entry,
            None => {
                let entry = self.load_backend(key).await?;
                if self.is_purgeable(&entry, now) {
                    return None;
                }
                self.entries.write().await.insert(key.clone(), entry.clone());
                entry
            }
        };

        if !entry.is_expired_at(now) {
            debug!(%key, "snapshot cache hit");
            return Some(entry.snapshot);
        }

        if self.is_purgeable(&entry, now) {
            self.entries.write().await.remove(key);
            debug!(%key, "purged snapshot past stale retention");
        } else {
            debug!(%key, "snapshot cache entry expired");
        }
        None
    }

    /// Entry regardless of expiry; the degraded-mode fallback when a live fetch fails.
    pub async fn get_stale(&self, key: &CacheKey) -> Option<SheetSnapshot> {
        if let Some(entry) = self.entries.read().await.get(key) {
            warn!(%key, expires_at = %entry.expires_at, "serving snapshot from stale read");
            return Some(entry.snapshot.clone());
        }
        let entry = self.load_backend(key).await?;
        warn!(%key, expires_at = %entry.expires_at, "serving snapshot from stale read");
        Some(entry.snapshot)
    }

    pub async fn put(&self, key: CacheKey, snapshot: SheetSnapshot, ttl: Duration) {
        self.put_at(key, snapshot, ttl, Utc::now()).await
    }

    pub async fn put_at(
        &self,
        key: CacheKey,
        snapshot: SheetSnapshot,
        ttl: Duration,
        now: DateTime<Utc>,
    ) {
        let entry = CacheEntry {
            key: key.clone(),
            snapshot,
            stored_at: now,
            expires_at: now + chrono_span(ttl),
        };
        if let Some(backend) = &self.backend {
            if let Err(err) = backend.save(&entry).await {
                warn!(%key, error = %err, "persisting snapshot cache entry failed");
            }
        }
        self.entries.write().await.insert(key, entry);
    }

    /// Previously cached content hash for a key, fresh or not.
    pub async fn content_hash(&self, key: &CacheKey) -> Option<String> {
        self.entries
            .read()
            .await
            .get(key)
            .map(|entry| entry.snapshot.content_hash.clone())
    }

    /// Drops entries past stale retention, in memory and in the backend.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> u64 {
        let purged = {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|_, entry| !self.is_purgeable(entry, now));
            (before - entries.len()) as u64
        };
        let Some(backend) = &self.backend else {
            return purged;
        };
        let Some(cutoff) = now.checked_sub_signed(chrono_span(self.policy.stale_retention)) else {
            return purged;
        };
        match backend.purge_before(cutoff).await {
            Ok(removed) => purged + removed,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "purging persisted snapshots failed");
                purged
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn load_backend(&self, key: &CacheKey) -> Option<CacheEntry> {
        let backend = self.backend.as_ref()?;
        match backend.load(key).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%key, error = %err, "loading persisted snapshot failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct ScriptedSource {
        titles: Vec<String>,
        listing_error: Option<SourceError>,
        payload: JsonValue,
        read_script: StdMutex<VecDeque<SourceError>>,
        reads: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(titles: &[&str], payload: JsonValue, failures: Vec<SourceError>) -> Self {
            Self {
                titles: titles.iter().map(|s| s.to_string()).collect(),
                listing_error: None,
                payload,
                read_script: StdMutex::new(failures.into()),
                reads: AtomicUsize::new(0),
            }
        }

        fn with_listing_error(mut self, err: SourceError) -> Self {
            self.listing_error = Some(err);
            self
        }
    }

    #[async_trait]
    impl SheetSource for ScriptedSource {
        async fn list_sheets(&self, _document_id: &str) -> Result<Vec<String>, SourceError> {
            match &self.listing_error {
                Some(err) => Err(err.clone()),
                None => Ok(self.titles.clone()),
            }
        }

        async fn read_values(
            &self,
            _document_id: &str,
            _sheet_title: &str,
        ) -> Result<JsonValue, SourceError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.read_script.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(self.payload.clone())
        }
    }

    fn fast_fetcher(source: Arc<dyn SheetSource>) -> SheetFetcher {
        SheetFetcher::new(
            source,
            FetcherConfig {
                backoff: BackoffPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(4),
                },
                ..Default::default()
            },
        )
    }

    fn rate_limited() -> SourceError {
        SourceError::RateLimited { retry_after: None }
    }

    fn aliases(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(policy.max_total_delay(), Duration::from_millis(1000));
        assert_eq!(BackoffPolicy::default().max_total_delay(), Duration::from_secs(6));
    }

    #[test]
    fn retry_after_hint_is_honoured_up_to_the_cap() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
        };
        assert_eq!(policy.retry_delay(0, None), Duration::from_millis(100));
        assert_eq!(
            policy.retry_delay(0, Some(Duration::from_millis(500))),
            Duration::from_millis(500)
        );
        // A hint shorter than the backoff step does not shorten it.
        assert_eq!(
            policy.retry_delay(1, Some(Duration::from_millis(50))),
            Duration::from_millis(200)
        );
        assert_eq!(
            policy.retry_delay(0, Some(Duration::from_secs(60))),
            Duration::from_millis(800)
        );
    }

    #[tokio::test]
    async fn quota_pacer_allows_a_burst_then_spaces_calls() {
        let quota = QuotaWindow {
            requests: 2,
            window: Duration::from_millis(100),
        };
        assert_eq!(quota.interval(), Duration::from_millis(50));

        let pacer = QuotaPacer::new(quota);
        let started = Instant::now();
        pacer.acquire().await;
        pacer.acquire().await;
        assert!(started.elapsed() < Duration::from_millis(40));
        pacer.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn only_too_many_requests_is_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::NonRetryable
        );
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    #[test]
    fn alias_resolution_normalizes_whitespace_and_keeps_display_title() {
        let available = aliases(&["人 員資料庫", "排班結果表 ", "Summary"]);
        let resolved = resolve_sheet_name(&available, &aliases(&["Employee", "人員資料庫"]));
        assert_eq!(
            resolved,
            Some(("人員資料庫".to_string(), "人 員資料庫".to_string()))
        );

        let resolved = resolve_sheet_name(&available, &aliases(&["　排班結果表", "結果表"]));
        assert_eq!(resolved.map(|(_, title)| title), Some("排班結果表 ".to_string()));

        assert_eq!(
            resolve_sheet_name(&available, &aliases(&["summary"])).map(|(_, t)| t),
            Some("Summary".into())
        );
        assert!(resolve_sheet_name(&available, &aliases(&["Results", ""])).is_none());
    }

    #[test]
    fn coercion_reads_values_envelope_and_pads_short_rows() {
        let payload = json!({
            "range": "'排班結果表'!A1:C3",
            "values": [["員工(姓名/ID)", "2025/11/01", "2025/11/02"], ["王小明/E04", "D"], ["", "", ""]]
        });
        let coerced = coerce_rows(&payload);
        assert_eq!(coerced.columns.len(), 3);
        assert_eq!(coerced.rows.len(), 1);
        assert_eq!(coerced.rows[0]["2025/11/02"], "");
        assert!(coerced.malformed.is_none());
    }

    #[test]
    fn coercion_discards_non_mapping_rows() {
        let payload = json!([{"username": "E01", "n": 3}, 7, null, "text", {"username": "E02"}]);
        let coerced = coerce_rows(&payload);
        assert_eq!(coerced.rows.len(), 2);
        assert_eq!(coerced.discarded, 3);
        assert_eq!(coerced.rows[0]["n"], "3");

        let grid = json!([["a", "b"], 5, ["1", "2"]]);
        let coerced = coerce_rows(&grid);
        assert_eq!(coerced.rows.len(), 1);
        assert_eq!(coerced.discarded, 1);
    }

    #[test]
    fn coercion_of_scalar_or_null_is_empty_and_flagged() {
        for payload in [json!(null), json!(42), json!("rows"), json!({"error": "x"})] {
            let coerced = coerce_rows(&payload);
            assert!(coerced.rows.is_empty());
            assert!(coerced.malformed.is_some(), "payload {payload}");
        }
        let empty_tab = coerce_rows(&json!({"range": "'x'!A1:Z1000", "majorDimension": "ROWS"}));
        assert!(empty_tab.rows.is_empty());
        assert!(empty_tab.malformed.is_none());
    }

    #[tokio::test]
    async fn fetch_retries_rate_limits_then_succeeds() {
        let source = Arc::new(ScriptedSource::new(
            &["人員資料庫"],
            json!([["username"], ["E01"]]),
            vec![rate_limited(), rate_limited()],
        ));
        let fetcher = fast_fetcher(source.clone());
        let snapshot = fetcher
            .fetch("doc-1", &aliases(&["Employee", "人 員資料庫"]))
            .await
            .expect("fetch succeeds on third attempt");
        assert_eq!(source.reads.load(Ordering::SeqCst), 3);
        assert_eq!(snapshot.sheet_name, "人員資料庫");
        assert_eq!(snapshot.requested_alias, "人 員資料庫");
        assert_eq!(snapshot.rows.len(), 1);
        assert!(snapshot.success);
    }

    #[tokio::test]
    async fn fetch_returns_structured_rate_limit_after_budget() {
        let source = Arc::new(ScriptedSource::new(
            &["Results"],
            json!([]),
            vec![rate_limited(), rate_limited(), rate_limited()],
        ));
        let fetcher = fast_fetcher(source.clone());
        let err = fetcher
            .fetch("doc-1", &aliases(&["Results"]))
            .await
            .expect_err("budget exhausted");
        assert_eq!(
            err,
            FetchError::RateLimited {
                document_id: "doc-1".into(),
                attempts: 3
            }
        );
        assert_eq!(err.kind(), SheetErrorKind::RateLimited);
        assert_eq!(source.reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fetch_waits_for_retry_after_hint_within_cap() {
        let source = Arc::new(ScriptedSource::new(
            &["Results"],
            json!([["username"], ["E01"]]),
            vec![
                SourceError::RateLimited {
                    retry_after: Some(Duration::from_millis(30)),
                },
                SourceError::RateLimited {
                    retry_after: Some(Duration::from_secs(120)),
                },
            ],
        ));
        let fetcher = SheetFetcher::new(
            source.clone(),
            FetcherConfig {
                backoff: BackoffPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(40),
                },
                ..Default::default()
            },
        );

        let started = Instant::now();
        let snapshot = fetcher.fetch("doc-1", &aliases(&["Results"])).await.unwrap();
        let elapsed = started.elapsed();
        assert!(snapshot.success);
        assert_eq!(source.reads.load(Ordering::SeqCst), 3);
        assert!(elapsed >= Duration::from_millis(70), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(10), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn fetcher_paces_calls_to_the_quota_window() {
        let source = Arc::new(ScriptedSource::new(
            &["Results"],
            json!([["username"], ["E01"]]),
            vec![],
        ));
        let started = Instant::now();
        let fetcher = SheetFetcher::new(
            source.clone(),
            FetcherConfig {
                quota: Some(QuotaWindow {
                    requests: 2,
                    window: Duration::from_millis(100),
                }),
                ..Default::default()
            },
        );

        // Each fetch lists the document and reads one tab: four calls in total.
        fetcher.fetch("doc-1", &aliases(&["Results"])).await.unwrap();
        fetcher.fetch("doc-1", &aliases(&["Results"])).await.unwrap();
        let elapsed = started.elapsed();
        assert_eq!(source.reads.load(Ordering::SeqCst), 2);
        assert!(elapsed >= Duration::from_millis(90), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn malformed_listing_is_reported_as_malformed_data() {
        let source = Arc::new(
            ScriptedSource::new(&[], json!([]), vec![])
                .with_listing_error(SourceError::Malformed("sheets is not an array".into())),
        );
        let fetcher = fast_fetcher(source.clone());
        let err = fetcher.fetch("doc-1", &aliases(&["Results"])).await.unwrap_err();
        assert!(matches!(err, FetchError::Malformed { .. }));
        assert_eq!(err.kind(), SheetErrorKind::MalformedData);
        assert_eq!(source.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transport_failures_are_not_retried() {
        let source = Arc::new(ScriptedSource::new(
            &["Results"],
            json!([]),
            vec![SourceError::Transport {
                status: Some(500),
                message: "backend error".into(),
            }],
        ));
        let fetcher = fast_fetcher(source.clone());
        let err = fetcher.fetch("doc-1", &aliases(&["Results"])).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport { status: Some(500), .. }));
        assert_eq!(source.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_sheet_reports_available_titles() {
        let source = Arc::new(ScriptedSource::new(&["Summary"], json!([]), vec![]));
        let fetcher = fast_fetcher(source);
        let err = fetcher
            .fetch("doc-1", &aliases(&["排班結果表", "Results"]))
            .await
            .unwrap_err();
        match err {
            FetchError::SheetNotFound { available, .. } => assert_eq!(available, vec!["Summary"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_payload_yields_empty_unsuccessful_snapshot() {
        let source = Arc::new(ScriptedSource::new(&["Results"], json!("oops"), vec![]));
        let fetcher = fast_fetcher(source);
        let snapshot = fetcher.fetch("doc-1", &aliases(&["Results"])).await.unwrap();
        assert!(!snapshot.success);
        assert!(snapshot.rows.is_empty());
        assert!(snapshot.error.is_some());
    }

    fn sample_snapshot(tag: &str) -> SheetSnapshot {
        let mut row = RowMap::new();
        row.insert("username".into(), tag.into());
        SheetSnapshot::new(
            "doc-1",
            "Employee",
            "Employee",
            vec!["username".into()],
            vec![row],
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn cache_never_serves_expired_entries_but_stale_read_does() {
        let cache = SnapshotCache::new(CachePolicy {
            ttl: Duration::from_secs(300),
            stale_retention: Duration::from_secs(3600),
        });
        let key = CacheKey::new("doc-1", "employee");
        let t0 = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        cache
            .put_at(key.clone(), sample_snapshot("E01"), Duration::from_secs(300), t0)
            .await;
        assert!(cache.get_at(&key, t0 + chrono::Duration::seconds(299)).await.is_some());
        assert!(cache.get_at(&key, t0 + chrono::Duration::seconds(301)).await.is_none());
        assert!(cache.get_stale(&key).await.is_some());

        assert!(cache.get_at(&key, t0 + chrono::Duration::hours(2)).await.is_none());
        assert_eq!(cache.len().await, 0);
        assert!(cache.get_stale(&key).await.is_none());
    }

    #[tokio::test]
    async fn cache_put_is_last_write_wins() {
        let cache = SnapshotCache::new(CachePolicy::default());
        let key = CacheKey::new("doc-1", "employee");
        cache.put(key.clone(), sample_snapshot("E01"), cache.default_ttl()).await;
        cache.put(key.clone(), sample_snapshot("E02"), cache.default_ttl()).await;
        let snapshot = cache.get(&key).await.unwrap();
        assert_eq!(snapshot.rows[0]["username"], "E02");
        assert_eq!(cache.content_hash(&key).await, Some(snapshot.content_hash));
    }

    #[tokio::test]
    async fn file_backend_survives_cache_restart() {
        let dir = tempdir().expect("tempdir");
        let backend = Arc::new(FileSnapshotBackend::new(dir.path()));
        let key = CacheKey::new("doc-1", "final_output");

        let first = SnapshotCache::new(CachePolicy::default()).with_backend(backend.clone());
        first
            .put(key.clone(), sample_snapshot("E04"), Duration::from_secs(0))
            .await;
        let path = dir.path().join(backend.entry_relative_path(&key));
        assert!(path.exists());

        let restarted = SnapshotCache::new(CachePolicy::default()).with_backend(backend);
        let stale = restarted.get_stale(&key).await.expect("stale copy on disk");
        assert_eq!(stale.rows[0]["username"], "E04");
        assert!(restarted
            .get_at(&key, Utc::now() + chrono::Duration::seconds(5))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn purge_drops_entries_past_retention_in_memory_and_on_disk() {
        let dir = tempdir().expect("tempdir");
        let backend = Arc::new(FileSnapshotBackend::new(dir.path()));
        let cache = SnapshotCache::new(CachePolicy {
            ttl: Duration::from_secs(300),
            stale_retention: Duration::from_secs(3600),
        })
        .with_backend(backend.clone());
        let t0 = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let old = CacheKey::new("doc-1", "final_output");
        let recent = CacheKey::new("doc-1", "employee");
        let ttl = Duration::from_secs(300);
        cache.put_at(old.clone(), sample_snapshot("E01"), ttl, t0).await;
        let later = t0 + chrono::Duration::hours(3);
        cache.put_at(recent.clone(), sample_snapshot("E04"), ttl, later).await;

        assert_eq!(cache.purge_expired(later).await, 2);
        assert_eq!(cache.len().await, 1);
        assert!(!dir.path().join(backend.entry_relative_path(&old)).exists());
        assert!(dir.path().join(backend.entry_relative_path(&recent)).exists());
        assert_eq!(cache.purge_expired(later).await, 0);
    }

    #[test]
    fn snapshot_paths_are_stable_per_key() {
        let backend = FileSnapshotBackend::new("/tmp/x");
        let a = backend.entry_relative_path(&CacheKey::new("doc", "員工預排班表"));
        let b = backend.entry_relative_path(&CacheKey::new("doc", "員工預排班表"));
        let c = backend.entry_relative_path(&CacheKey::new("doc", "final_output"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(
            FileSnapshotBackend::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
