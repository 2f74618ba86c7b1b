//! Core domain model and identifier normalization for shiftsync.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shiftsync-core";

/// One spreadsheet row: field name -> cell text.
pub type RowMap = BTreeMap<String, String>;

/// Identifier comparison key: all whitespace removed (ASCII and full-width), uppercased.
pub fn normalize_identifier(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Comparison key for sheet titles. Display strings keep their original form.
pub fn normalize_sheet_name(input: &str) -> String {
    normalize_identifier(input)
}

/// Non-empty trimmed segments of a composite `"Name/Code"` cell.
pub fn split_segments(cell: &str) -> impl Iterator<Item = &str> {
    cell.split(['/', '／'])
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
}

pub fn is_composite(cell: &str) -> bool {
    cell.contains(['/', '／'])
}

/// Canonical external id of a cell: the code-like segment (letters and digits) of a
/// composite cell, otherwise the whole normalized cell.
pub fn canonical_external_id(raw: &str) -> String {
    if is_composite(raw) {
        if let Some(code) = split_segments(raw).find(|segment| {
            segment.chars().any(char::is_alphabetic) && segment.chars().any(|c| c.is_ascii_digit())
        }) {
            return normalize_identifier(code);
        }
    }
    normalize_identifier(raw)
}

/// Stable SHA-256 over the row content of a snapshot.
pub fn fingerprint_rows(columns: &[String], rows: &[RowMap]) -> String {
    let mut hasher = Sha256::new();
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update([0x1f]);
    }
    hasher.update([0x1e]);
    for row in rows {
        for (field, value) in row {
            hasher.update(field.as_bytes());
            hasher.update([0x1f]);
            hasher.update(value.as_bytes());
            hasher.update([0x1f]);
        }
        hasher.update([0x1e]);
    }
    hex::encode(hasher.finalize())
}

/// Cache identity of one logical sheet within one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub document_id: String,
    pub sheet_key: String,
}

impl CacheKey {
    pub fn new(document_id: impl Into<String>, sheet_key: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            sheet_key: sheet_key.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.document_id, self.sheet_key)
    }
}

/// One fetched tab at a point in time.
///
/// `rows` is always a sequence of field maps; malformed payloads become an empty
/// sequence with `success = false` and the reason in `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetSnapshot {
    pub document_id: String,
    /// Sheet title as it exists in the document.
    pub sheet_name: String,
    /// Candidate alias that resolved to `sheet_name`.
    pub requested_alias: String,
    pub columns: Vec<String>,
    pub rows: Vec<RowMap>,
    pub fetched_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub content_hash: String,
}

impl SheetSnapshot {
    pub fn new(
        document_id: impl Into<String>,
        sheet_name: impl Into<String>,
        requested_alias: impl Into<String>,
        columns: Vec<String>,
        rows: Vec<RowMap>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let content_hash = fingerprint_rows(&columns, &rows);
        Self {
            document_id: document_id.into(),
            sheet_name: sheet_name.into(),
            requested_alias: requested_alias.into(),
            columns,
            rows,
            fetched_at,
            success: true,
            error: None,
            content_hash,
        }
    }

    /// Snapshot for a payload that could not be read as rows.
    pub fn malformed(
        document_id: impl Into<String>,
        sheet_name: impl Into<String>,
        requested_alias: impl Into<String>,
        fetched_at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        let mut snapshot = Self::new(
            document_id,
            sheet_name,
            requested_alias,
            Vec::new(),
            Vec::new(),
            fetched_at,
        );
        snapshot.success = false;
        snapshot.error = Some(reason.into());
        snapshot
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// A cached snapshot plus its freshness window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub snapshot: SheetSnapshot,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityRole {
    Employee,
    ScheduleManager,
    ClientAdmin,
    SysAdmin,
}

impl EntityRole {
    /// Employees are registered under their sheet code, so the username is the
    /// external identifier by convention.
    pub fn is_self_identifying(self) -> bool {
        matches!(self, Self::Employee)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::ScheduleManager => "schedule_manager",
            Self::ClientAdmin => "client_admin",
            Self::SysAdmin => "sys_admin",
        }
    }
}

impl FromStr for EntityRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "employee" => Ok(Self::Employee),
            "schedule_manager" | "schedulemanager" => Ok(Self::ScheduleManager),
            "client_admin" | "clientadmin" => Ok(Self::ClientAdmin),
            "sys_admin" | "sysadmin" => Ok(Self::SysAdmin),
            other => Err(format!("unknown entity role `{other}`")),
        }
    }
}

/// Internal user record owned by the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalEntity {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    pub role: EntityRole,
}

impl InternalEntity {
    pub fn synthesized_id(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    Explicit,
    Inferred,
}

impl DiscoverySource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Inferred => "inferred",
        }
    }
}

impl FromStr for DiscoverySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explicit" => Ok(Self::Explicit),
            "inferred" => Ok(Self::Inferred),
            other => Err(format!("unknown discovery source `{other}`")),
        }
    }
}

/// Resolution strategy tier, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Persisted,
    Reference,
    SelfIdentifying,
    Derived,
}

impl MatchTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Persisted => "persisted",
            Self::Reference => "reference",
            Self::SelfIdentifying => "self_identifying",
            Self::Derived => "derived",
        }
    }
}

impl FromStr for MatchTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "persisted" => Ok(Self::Persisted),
            "reference" => Ok(Self::Reference),
            "self_identifying" => Ok(Self::SelfIdentifying),
            "derived" => Ok(Self::Derived),
            other => Err(format!("unknown match tier `{other}`")),
        }
    }
}

/// Memoized link between a spreadsheet identifier and an internal entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMapping {
    pub mapping_id: Uuid,
    /// Mapping scope; one sync target.
    pub scope: String,
    /// Canonical (normalized) identifier, e.g. `E04`.
    pub external_id: String,
    /// Identifier as it appeared in the sheet, e.g. `王小明/E04`.
    pub raw_external: String,
    pub entity_id: String,
    pub source: DiscoverySource,
    pub tier: MatchTier,
    pub created_at: DateTime<Utc>,
    pub last_verified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Latency-sensitive request path.
    Interactive,
    /// Daily background run.
    Periodic,
    /// Background staleness sweep.
    Auto,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Periodic => "periodic",
            Self::Auto => "auto",
        }
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interactive" | "manual" => Ok(Self::Interactive),
            "periodic" | "scheduled" | "daily" => Ok(Self::Periodic),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown trigger `{other}`")),
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InProgress,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Only `in_progress -> {success, failed}` is allowed.
    pub fn can_transition_to(self, next: SyncStatus) -> bool {
        self == Self::InProgress && next.is_terminal()
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown sync status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetErrorKind {
    RateLimited,
    Transport,
    SheetNotFound,
    MalformedData,
}

/// Per-sheet failure captured in a sync record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetError {
    pub role: String,
    pub kind: SheetErrorKind,
    pub critical: bool,
    pub message: String,
}

/// One sync attempt. Append-only; status moves once from `in_progress` to a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub record_id: Uuid,
    pub target_id: String,
    pub status: SyncStatus,
    pub trigger: TriggerKind,
    pub triggered_by: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub rows_affected: u64,
    pub entities_synced: u64,
    pub entities_unmatched: u64,
    pub error: Option<String>,
    pub sheet_errors: Vec<SheetError>,
}

impl SyncRecord {
    pub fn begin(
        target_id: impl Into<String>,
        trigger: TriggerKind,
        triggered_by: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            target_id: target_id.into(),
            status: SyncStatus::InProgress,
            trigger,
            triggered_by,
            started_at,
            finished_at: None,
            duration_ms: None,
            rows_affected: 0,
            entities_synced: 0,
            entities_unmatched: 0,
            error: None,
            sheet_errors: Vec::new(),
        }
    }
}

/// Terminal data written onto an in-progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCompletion {
    pub status: SyncStatus,
    pub finished_at: DateTime<Utc>,
    pub rows_affected: u64,
    pub entities_synced: u64,
    pub entities_unmatched: u64,
    pub error: Option<String>,
    pub sheet_errors: Vec<SheetError>,
}

impl SyncRecord {
    /// Applies a completion if the transition is legal; returns false otherwise.
    pub fn complete(&mut self, completion: SyncCompletion) -> bool {
        if !self.status.can_transition_to(completion.status) {
            return false;
        }
        self.status = completion.status;
        self.duration_ms = Some((completion.finished_at - self.started_at).num_milliseconds());
        self.finished_at = Some(completion.finished_at);
        self.rows_affected = completion.rows_affected;
        self.entities_synced = completion.entities_synced;
        self.entities_unmatched = completion.entities_unmatched;
        self.error = completion.error;
        self.sheet_errors = completion.sheet_errors;
        true
    }
}

/// Denormalized per-entity, per-date schedule cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRow {
    pub target_id: String,
    pub entity_id: String,
    pub date: NaiveDate,
    /// Categorical value (shift code).
    pub category: String,
    /// Raw cell text.
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

impl CachedRow {
    /// Equality ignoring `updated_at`.
    pub fn same_content(&self, other: &CachedRow) -> bool {
        self.target_id == other.target_id
            && self.entity_id == other.entity_id
            && self.date == other.date
            && self.category == other.category
            && self.value == other.value
    }
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Smallest range covering every date, if any.
    pub fn covering(dates: impl IntoIterator<Item = NaiveDate>) -> Option<Self> {
        let mut iter = dates.into_iter();
        let first = iter.next()?;
        let (start, end) = iter.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d)));
        Some(Self { start, end })
    }
}
