//! Spreadsheet layout knowledge: sheet roles, identifier columns, schedule grids and fixtures.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use shiftsync_core::{normalize_identifier, DateRange, InternalEntity, RowMap, SheetSnapshot};
use shiftsync_storage::{SheetSource, SourceError};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "shiftsync-adapters";

/// Which document of a target a sheet lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentSlot {
    Parameters,
    Results,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetPurpose {
    /// Rows feeding `CachedRow`.
    Authoritative,
    /// Roster used to look up an entity's sheet identifier.
    Reference,
    Auxiliary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetSpec {
    /// Stable role key; also the cache key of the sheet.
    pub key: String,
    pub aliases: Vec<String>,
    pub slot: DocumentSlot,
    pub purpose: SheetPurpose,
    /// A failed critical sheet fails the whole sync.
    pub critical: bool,
    /// Optional sheets are skipped silently when absent.
    #[serde(default)]
    pub optional: bool,
}

impl SheetSpec {
    fn new(key: &str, aliases: &[&str], slot: DocumentSlot, purpose: SheetPurpose) -> Self {
        Self {
            key: key.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            slot,
            critical: purpose == SheetPurpose::Authoritative,
            purpose,
            optional: false,
        }
    }
}

pub const FINAL_OUTPUT: &str = "final_output";
pub const EMPLOYEE_ROSTER: &str = "employee";

pub fn default_sheet_specs() -> Vec<SheetSpec> {
    use DocumentSlot::{Parameters, Results};
    use SheetPurpose::{Auxiliary, Authoritative, Reference};

    let mut usage = SheetSpec::new("usage_notes", &["使用說明", "Instructions"], Parameters, Auxiliary);
    usage.optional = true;

    vec![
        SheetSpec::new("parameters", &["軟性限制", "Parameters"], Parameters, Auxiliary),
        SheetSpec::new("hard_rules", &["硬性限制", "Hard Rules"], Parameters, Auxiliary),
        SheetSpec::new(EMPLOYEE_ROSTER, &["人員資料庫", "Employee", "人員"], Parameters, Reference),
        SheetSpec::new(
            "preferences",
            &["員工預排班表", "預排班表", "Preferences", "Pre-Schedule"],
            Parameters,
            Auxiliary,
        ),
        SheetSpec::new("schedule_cycle", &["排班週期", "Schedule Cycle"], Parameters, Auxiliary),
        SheetSpec::new("demand", &["每月人力需求表", "Demand"], Parameters, Auxiliary),
        SheetSpec::new("shift_definitions", &["班別定義表", "Shift Definitions"], Parameters, Auxiliary),
        usage,
        SheetSpec::new(
            FINAL_OUTPUT,
            &["排班結果表", "結果表", "Schedule Results", "Final Output", "Results"],
            Results,
            Authoritative,
        ),
    ]
}

/// Per-target adjustments to a default sheet spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetOverride {
    #[serde(default)]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub critical: Option<bool>,
    #[serde(default)]
    pub optional: Option<bool>,
}

pub fn apply_sheet_overrides(
    mut specs: Vec<SheetSpec>,
    overrides: &BTreeMap<String, SheetOverride>,
) -> Vec<SheetSpec> {
    for spec in &mut specs {
        let Some(o) = overrides.get(&spec.key) else {
            continue;
        };
        if let Some(aliases) = &o.aliases {
            // Overrides go first; defaults remain as fallbacks.
            let mut merged = aliases.clone();
            merged.extend(spec.aliases.iter().filter(|a| !aliases.contains(a)).cloned());
            spec.aliases = merged;
        }
        if let Some(critical) = o.critical {
            spec.critical = critical;
        }
        if let Some(optional) = o.optional {
            spec.optional = optional;
        }
    }
    specs
}

/// Candidate identifier column names, most specific first.
pub const IDENTIFIER_COLUMNS: &[&str] = &[
    "員工(姓名/ID)",
    "員工姓名/ID",
    "姓名/員工ID",
    "姓名/ID",
    "員工",
    "username",
    "employee_id",
    "employee_name",
    "name",
    "用户名",
    "员工ID",
    "员工姓名",
    "員工ID",
    "員工姓名",
    "姓名",
];

/// Roster columns that carry a bare employee code.
pub const CODE_COLUMNS: &[&str] = &["ID", "employee_id", "員工ID", "员工ID", "員工編號", "code"];

/// Roster columns that carry a display name.
pub const NAME_COLUMNS: &[&str] = &["姓名", "員工姓名", "员工姓名", "name", "employee_name", "full_name"];

/// First candidate that names a column, compared after normalization.
/// Returns the column as it appears.
pub fn find_column<'a>(columns: &'a [String], candidates: &[&str]) -> Option<&'a str> {
    candidates.iter().find_map(|candidate| {
        let wanted = normalize_identifier(candidate);
        columns
            .iter()
            .find(|column| normalize_identifier(column) == wanted)
            .map(String::as_str)
    })
}

pub fn detect_identifier_column(columns: &[String]) -> Option<&str> {
    find_column(columns, IDENTIFIER_COLUMNS)
}

/// Reads a header such as `2025/11/01`, `2025-11-01` or `2025/11/01 (六)` as a date.
pub fn parse_date_column(header: &str) -> Option<NaiveDate> {
    let head = header
        .trim()
        .split(|c: char| c.is_whitespace() || c == '(' || c == '（')
        .next()?;
    ["%Y/%m/%d", "%Y-%m-%d", "%Y.%m.%d"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(head, format).ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShiftCategory {
    Off,
    Day,
    Evening,
    Night,
    /// Any other non-empty assignment, e.g. `A 櫃台人力`.
    Assign,
}

impl ShiftCategory {
    pub fn code(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Day => "D",
            Self::Evening => "E",
            Self::Night => "N",
            Self::Assign => "ASSIGN",
        }
    }

    pub fn time_range(self) -> Option<&'static str> {
        match self {
            Self::Day => Some("08:00 - 17:00"),
            Self::Evening => Some("16:00 - 01:00"),
            Self::Night => Some("00:00 - 09:00"),
            Self::Off | Self::Assign => None,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "OFF" => Some(Self::Off),
            "D" => Some(Self::Day),
            "E" => Some(Self::Evening),
            "N" => Some(Self::Night),
            "ASSIGN" => Some(Self::Assign),
            _ => None,
        }
    }
}

/// Classifies one schedule cell. Empty cells carry no assignment.
pub fn classify_shift(cell: &str) -> Option<ShiftCategory> {
    let text = cell.trim();
    if text.is_empty() {
        return None;
    }
    let upper = text.to_uppercase();
    if matches!(upper.as_str(), "OFF" | "休" | "休假" | "例假" | "OFF DAY") || upper.starts_with("休")
    {
        return Some(ShiftCategory::Off);
    }
    if text.contains("大夜") {
        return Some(ShiftCategory::Night);
    }
    if text.contains("小夜") {
        return Some(ShiftCategory::Evening);
    }
    if text.starts_with('白') {
        return Some(ShiftCategory::Day);
    }
    let leading = upper.split_whitespace().next().unwrap_or_default();
    match leading {
        "D" => Some(ShiftCategory::Day),
        "E" => Some(ShiftCategory::Evening),
        "N" => Some(ShiftCategory::Night),
        _ => Some(ShiftCategory::Assign),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleCell {
    pub date: NaiveDate,
    pub category: ShiftCategory,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    #[error("no identifier column among {0:?}")]
    NoIdentifierColumn(Vec<String>),
    #[error("no date columns among {0:?}")]
    NoDateColumns(Vec<String>),
}

/// Wide schedule sheet: one row per person, one column per date.
#[derive(Debug, Clone)]
pub struct ScheduleGrid {
    pub identifier_column: String,
    pub date_columns: Vec<(String, NaiveDate)>,
    pub rows: Vec<RowMap>,
}

impl ScheduleGrid {
    pub fn from_snapshot(snapshot: &SheetSnapshot) -> Result<Self, GridError> {
        let identifier_column = detect_identifier_column(&snapshot.columns)
            .ok_or_else(|| GridError::NoIdentifierColumn(snapshot.columns.clone()))?
            .to_string();

        let date_columns: Vec<(String, NaiveDate)> = snapshot
            .columns
            .iter()
            .filter_map(|column| parse_date_column(column).map(|date| (column.clone(), date)))
            .collect();
        if date_columns.is_empty() {
            return Err(GridError::NoDateColumns(snapshot.columns.clone()));
        }

        let rows: Vec<RowMap> = snapshot
            .rows
            .iter()
            .filter(|row| {
                let keep = row
                    .get(&identifier_column)
                    .is_some_and(|id| !id.trim().is_empty());
                if !keep {
                    debug!(
                        sheet = %snapshot.sheet_name,
                        "skipping schedule row without identifier"
                    );
                }
                keep
            })
            .cloned()
            .collect();

        Ok(Self {
            identifier_column,
            date_columns,
            rows,
        })
    }

    /// Min..max of the sheet's date columns.
    pub fn date_range(&self) -> Option<DateRange> {
        DateRange::covering(self.date_columns.iter().map(|(_, date)| *date))
    }

    pub fn identifier<'a>(&self, row: &'a RowMap) -> &'a str {
        row.get(&self.identifier_column).map(String::as_str).unwrap_or_default()
    }

    pub fn cells_for_row(&self, row: &RowMap) -> Vec<ScheduleCell> {
        self.date_columns
            .iter()
            .filter_map(|(column, date)| {
                let value = row.get(column)?.trim();
                let category = classify_shift(value)?;
                Some(ScheduleCell {
                    date: *date,
                    category,
                    value: value.to_string(),
                })
            })
            .collect()
    }
}

/// Offline documents: document id -> sheet title -> raw values payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub documents: BTreeMap<String, BTreeMap<String, JsonValue>>,
    #[serde(default)]
    pub entities: Vec<InternalEntity>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// `SheetSource` over a fixture bundle, with scriptable failures for tests and drills.
#[derive(Debug, Default)]
pub struct FixtureSheetSource {
    documents: Mutex<BTreeMap<String, BTreeMap<String, JsonValue>>>,
    failures: Mutex<HashMap<String, VecDeque<SourceError>>>,
}

impl FixtureSheetSource {
    pub fn new(bundle: &FixtureBundle) -> Self {
        Self {
            documents: Mutex::new(bundle.documents.clone()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Queues errors returned by the next reads of `document_id`, before any data.
    pub fn fail_next(&self, document_id: &str, errors: impl IntoIterator<Item = SourceError>) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures
            .entry(document_id.to_string())
            .or_default()
            .extend(errors);
    }

    pub fn set_sheet(&self, document_id: &str, title: &str, payload: JsonValue) {
        let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        documents
            .entry(document_id.to_string())
            .or_default()
            .insert(title.to_string(), payload);
    }

    pub fn remove_sheet(&self, document_id: &str, title: &str) {
        let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sheets) = documents.get_mut(document_id) {
            sheets.remove(title);
        }
    }

    fn next_failure(&self, document_id: &str) -> Option<SourceError> {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.get_mut(document_id)?.pop_front()
    }
}

#[async_trait]
impl SheetSource for FixtureSheetSource {
    async fn list_sheets(&self, document_id: &str) -> Result<Vec<String>, SourceError> {
        let documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        documents
            .get(document_id)
            .map(|sheets| sheets.keys().cloned().collect())
            .ok_or_else(|| SourceError::NotFound(format!("document {document_id}")))
    }

    async fn read_values(
        &self,
        document_id: &str,
        sheet_title: &str,
    ) -> Result<JsonValue, SourceError> {
        if let Some(err) = self.next_failure(document_id) {
            return Err(err);
        }
        let documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        documents
            .get(document_id)
            .and_then(|sheets| sheets.get(sheet_title))
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("{document_id}/{sheet_title}")))
    }
}
