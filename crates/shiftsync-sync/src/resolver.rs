//! Identity reconciliation between internal entities and spreadsheet identifiers.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use shiftsync_adapters::{detect_identifier_column, find_column, CODE_COLUMNS, NAME_COLUMNS};
use shiftsync_core::{
    canonical_external_id, normalize_identifier, split_segments, DiscoverySource, IdentityMapping,
    InternalEntity, MatchTier, RowMap,
};
use strsim::jaro_winkler;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{MappingWrite, SyncStore};

/// Shortest normalized candidate allowed to match by containment.
pub const MIN_CONTAINMENT_CHARS: usize = 3;

const SUGGESTION_THRESHOLD: f64 = 0.8;
const MAX_SUGGESTIONS: usize = 3;

/// Rows plus the columns whose cells identify a row.
#[derive(Debug, Clone)]
pub struct Dataset<'a> {
    key_columns: Vec<String>,
    rows: &'a [RowMap],
}

impl<'a> Dataset<'a> {
    pub fn new(key_columns: Vec<String>, rows: &'a [RowMap]) -> Self {
        Self { key_columns, rows }
    }

    /// Authoritative rows keyed by their single identifier column.
    pub fn authoritative(identifier_column: &str, rows: &'a [RowMap]) -> Self {
        Self::new(vec![identifier_column.to_string()], rows)
    }

    /// Roster rows keyed by the identifier, code and name columns that exist.
    pub fn reference(columns: &[String], rows: &'a [RowMap]) -> Option<Self> {
        let mut key_columns: Vec<String> = Vec::new();
        let found = detect_identifier_column(columns)
            .into_iter()
            .chain(find_column(columns, CODE_COLUMNS))
            .chain(find_column(columns, NAME_COLUMNS));
        for column in found {
            if !key_columns.iter().any(|c| c == column) {
                key_columns.push(column.to_string());
            }
        }
        (!key_columns.is_empty()).then(|| Self::new(key_columns, rows))
    }

    fn cells<'r>(&'r self, row: &'r RowMap) -> impl Iterator<Item = &'r str> + 'r {
        self.key_columns
            .iter()
            .filter_map(move |column| row.get(column))
            .map(|cell| cell.trim())
            .filter(|cell| !cell.is_empty())
    }

    /// Primary identifier cell of a row.
    pub fn identifier_of(&self, index: usize) -> Option<&'a str> {
        let column = self.key_columns.first()?;
        self.rows.get(index)?.get(column).map(String::as_str)
    }

    fn all_identifiers(&self) -> impl Iterator<Item = &'a str> + '_ {
        (0..self.rows.len()).filter_map(|i| self.identifier_of(i))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    Exact,
    Segment,
    Containment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowMatch {
    pub index: usize,
    pub rule: MatchRule,
}

/// Finds the row identified by `candidate`.
///
/// Rules are tried in order: whole-cell equality, equality with one `/` segment of
/// a composite cell, then containment. Containment only counts when exactly one
/// row qualifies and the candidate is at least [`MIN_CONTAINMENT_CHARS`] long.
pub fn match_rows(dataset: &Dataset<'_>, candidate: &str) -> Option<RowMatch> {
    let wanted = normalize_identifier(candidate);
    if wanted.is_empty() {
        return None;
    }
    match_whole_or_segment(dataset, &wanted).or_else(|| match_contained(dataset, &wanted))
}

/// Exact and segment rules only. Used where a near miss would hand over another row.
pub fn match_rows_strict(dataset: &Dataset<'_>, candidate: &str) -> Option<RowMatch> {
    let wanted = normalize_identifier(candidate);
    if wanted.is_empty() {
        return None;
    }
    match_whole_or_segment(dataset, &wanted)
}

fn match_whole_or_segment(dataset: &Dataset<'_>, wanted: &str) -> Option<RowMatch> {
    let exact = dataset.rows.iter().position(|row| {
        dataset
            .cells(row)
            .any(|cell| normalize_identifier(cell) == wanted)
    });
    if let Some(index) = exact {
        return Some(RowMatch {
            index,
            rule: MatchRule::Exact,
        });
    }

    let segment = dataset.rows.iter().position(|row| {
        dataset.cells(row).any(|cell| {
            split_segments(cell).any(|segment| normalize_identifier(segment) == wanted)
        })
    });
    segment.map(|index| RowMatch {
        index,
        rule: MatchRule::Segment,
    })
}

fn match_contained(dataset: &Dataset<'_>, wanted: &str) -> Option<RowMatch> {
    if wanted.chars().count() < MIN_CONTAINMENT_CHARS {
        return None;
    }
    let mut contained = dataset
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| dataset.cells(row).any(|cell| contains_candidate(cell, wanted)));
    match (contained.next(), contained.next()) {
        (Some((index, _)), None) => Some(RowMatch {
            index,
            rule: MatchRule::Containment,
        }),
        (Some(_), Some(_)) => {
            debug!(candidate = %wanted, "containment match is ambiguous");
            None
        }
        _ => None,
    }
}

/// `wanted` sits inside `cell` without splitting a run of ASCII letters and digits,
/// and the cell does not carry a different code of its own.
fn contains_candidate(cell: &str, wanted: &str) -> bool {
    let canonical = canonical_external_id(cell);
    if is_plain_code(&canonical) && canonical != wanted {
        return false;
    }
    let normalized = normalize_identifier(cell);
    normalized.match_indices(wanted).any(|(start, found)| {
        let end = start + found.len();
        let splits_before = normalized[..start]
            .chars()
            .next_back()
            .zip(found.chars().next())
            .is_some_and(|(outer, inner)| {
                outer.is_ascii_alphanumeric() && inner.is_ascii_alphanumeric()
            });
        let splits_after = normalized[end..]
            .chars()
            .next()
            .zip(found.chars().next_back())
            .is_some_and(|(outer, inner)| {
                outer.is_ascii_alphanumeric() && inner.is_ascii_alphanumeric()
            });
        !splits_before && !splits_after
    })
}

/// Letters and digits only, with at least one of each.
fn is_plain_code(value: &str) -> bool {
    value.chars().all(|c| c.is_ascii_alphanumeric())
        && value.chars().any(|c| c.is_ascii_alphabetic())
        && value.chars().any(|c| c.is_ascii_digit())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRow {
    pub entity_id: String,
    pub row_index: usize,
    pub raw_external: String,
    pub external_id: String,
    pub tier: MatchTier,
    pub rule: MatchRule,
    pub mapping: MappingWrite,
    pub scanned_reference: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoMatchReport {
    pub entity_id: String,
    /// Normalized candidates tried, in order.
    pub tried: Vec<String>,
    /// Closest identifiers present in the dataset, for operator follow-up.
    pub suggestions: Vec<(String, f64)>,
    /// Mappings that blocked an otherwise matching row.
    pub conflicts: Vec<IdentityMapping>,
    /// Persisted mapping whose identifier is no longer in the dataset.
    pub stale_mapping: Option<IdentityMapping>,
    /// Entity that already took the matched row in this run.
    pub claimed_by: Option<String>,
    pub scanned_reference: bool,
}

impl NoMatchReport {
    /// Report for a row that another entity resolved to first.
    pub fn row_claimed(found: &ResolvedRow, owner: &str) -> Self {
        Self {
            entity_id: found.entity_id.clone(),
            tried: vec![found.external_id.clone()],
            suggestions: Vec::new(),
            conflicts: Vec::new(),
            stale_mapping: None,
            claimed_by: Some(owner.to_string()),
            scanned_reference: found.scanned_reference,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Matched(ResolvedRow),
    NoMatch(NoMatchReport),
}

impl Resolution {
    pub fn matched(&self) -> Option<&ResolvedRow> {
        match self {
            Self::Matched(row) => Some(row),
            Self::NoMatch(_) => None,
        }
    }
}

pub struct IdentityResolver {
    store: Arc<dyn SyncStore>,
    synthesized_prefix: String,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn SyncStore>, synthesized_prefix: impl Into<String>) -> Self {
        Self {
            store,
            synthesized_prefix: synthesized_prefix.into(),
        }
    }

    /// Keys that may name the entity in a roster: username, full name, synthesized id, id.
    fn entity_keys(&self, entity: &InternalEntity) -> Vec<String> {
        let mut keys = vec![entity.username.clone()];
        keys.extend(entity.full_name.clone());
        keys.push(entity.synthesized_id(&self.synthesized_prefix));
        keys.push(entity.id.clone());
        keys
    }

    fn candidates(
        &self,
        entity: &InternalEntity,
        reference: Option<&Dataset<'_>>,
    ) -> Vec<(MatchTier, String)> {
        let mut out: Vec<(MatchTier, String)> = Vec::new();
        let mut push = |tier: MatchTier, value: &str| {
            let normalized = normalize_identifier(value);
            if !normalized.is_empty() && !out.iter().any(|(_, v)| *v == normalized) {
                out.push((tier, normalized));
            }
        };

        if let Some(reference) = reference {
            let roster_row = self
                .entity_keys(entity)
                .iter()
                .find_map(|key| match_rows(reference, key));
            if let Some(found) = roster_row {
                let row = &reference.rows[found.index];
                for cell in reference.cells(row) {
                    push(MatchTier::Reference, cell);
                    push(MatchTier::Reference, &canonical_external_id(cell));
                }
            }
        }

        if entity.role.is_self_identifying() {
            push(MatchTier::SelfIdentifying, &entity.username);
        }

        for key in self.entity_keys(entity) {
            push(MatchTier::Derived, &key);
        }
        out
    }

    /// Finds the authoritative row owned by `entity` within `scope`.
    ///
    /// A persisted mapping short-circuits every other strategy. On first success a
    /// mapping is persisted. `NoMatch` never carries another entity's row.
    pub async fn resolve(
        &self,
        scope: &str,
        entity: &InternalEntity,
        reference: Option<&Dataset<'_>>,
        authoritative: &Dataset<'_>,
    ) -> Result<Resolution> {
        if let Some(mapping) = self.store.find_mapping_for_entity(scope, &entity.id).await? {
            return self.resolve_persisted(entity, mapping, authoritative).await;
        }

        let candidates = self.candidates(entity, reference);
        let mut conflicts: Vec<IdentityMapping> = Vec::new();

        for (tier, candidate) in &candidates {
            let Some(found) = match_rows(authoritative, candidate) else {
                continue;
            };
            let raw_external = authoritative
                .identifier_of(found.index)
                .unwrap_or_default()
                .trim()
                .to_string();
            let external_id = canonical_external_id(&raw_external);
            if external_id.is_empty() {
                continue;
            }

            let now = Utc::now();
            let mapping = IdentityMapping {
                mapping_id: Uuid::new_v4(),
                scope: scope.to_string(),
                external_id: external_id.clone(),
                raw_external: raw_external.clone(),
                entity_id: entity.id.clone(),
                source: DiscoverySource::Inferred,
                tier: *tier,
                created_at: now,
                last_verified_at: now,
            };
            match self.store.upsert_mapping(&mapping).await? {
                MappingWrite::Conflict { existing } => {
                    warn!(
                        scope,
                        entity_id = %entity.id,
                        external_id = %external_id,
                        owner = %existing.entity_id,
                        "identity conflict; leaving unresolved"
                    );
                    if !conflicts.contains(&existing) {
                        conflicts.push(existing);
                    }
                }
                write => {
                    debug!(
                        scope,
                        entity_id = %entity.id,
                        external_id = %external_id,
                        tier = tier.as_str(),
                        rule = ?found.rule,
                        "identity resolved"
                    );
                    return Ok(Resolution::Matched(ResolvedRow {
                        entity_id: entity.id.clone(),
                        row_index: found.index,
                        raw_external,
                        external_id,
                        tier: *tier,
                        rule: found.rule,
                        mapping: write,
                        scanned_reference: reference.is_some(),
                    }));
                }
            }
        }

        let tried: Vec<String> = candidates.into_iter().map(|(_, c)| c).collect();
        let suggestions = closest_identifiers(&tried, authoritative);
        warn!(
            scope,
            entity_id = %entity.id,
            tried = ?tried,
            suggestions = ?suggestions,
            "no spreadsheet identifier matched entity"
        );
        Ok(Resolution::NoMatch(NoMatchReport {
            entity_id: entity.id.clone(),
            tried,
            suggestions,
            conflicts,
            stale_mapping: None,
            claimed_by: None,
            scanned_reference: reference.is_some(),
        }))
    }

    async fn resolve_persisted(
        &self,
        entity: &InternalEntity,
        mapping: IdentityMapping,
        authoritative: &Dataset<'_>,
    ) -> Result<Resolution> {
        let found = [mapping.external_id.as_str(), mapping.raw_external.as_str()]
            .into_iter()
            .find_map(|candidate| match_rows_strict(authoritative, candidate));

        let Some(found) = found else {
            warn!(
                scope = %mapping.scope,
                entity_id = %entity.id,
                external_id = %mapping.external_id,
                "mapped identifier absent from sheet"
            );
            return Ok(Resolution::NoMatch(NoMatchReport {
                entity_id: entity.id.clone(),
                tried: vec![mapping.external_id.clone()],
                suggestions: closest_identifiers(&[mapping.external_id.clone()], authoritative),
                conflicts: Vec::new(),
                stale_mapping: Some(mapping),
                claimed_by: None,
                scanned_reference: false,
            }));
        };

        let raw_external = authoritative
            .identifier_of(found.index)
            .unwrap_or_default()
            .trim()
            .to_string();
        let refreshed = IdentityMapping {
            raw_external: raw_external.clone(),
            last_verified_at: Utc::now(),
            ..mapping.clone()
        };
        let write = self.store.upsert_mapping(&refreshed).await?;
        Ok(Resolution::Matched(ResolvedRow {
            entity_id: entity.id.clone(),
            row_index: found.index,
            raw_external,
            external_id: mapping.external_id,
            tier: MatchTier::Persisted,
            rule: found.rule,
            mapping: write,
            scanned_reference: false,
        }))
    }

    /// Records an operator-supplied mapping. Existing claims are reported, never replaced.
    pub async fn register_explicit(
        &self,
        scope: &str,
        raw_external: &str,
        entity_id: &str,
    ) -> Result<MappingWrite> {
        let now = Utc::now();
        let mapping = IdentityMapping {
            mapping_id: Uuid::new_v4(),
            scope: scope.to_string(),
            external_id: canonical_external_id(raw_external),
            raw_external: raw_external.trim().to_string(),
            entity_id: entity_id.to_string(),
            source: DiscoverySource::Explicit,
            tier: MatchTier::Persisted,
            created_at: now,
            last_verified_at: now,
        };
        anyhow::ensure!(!mapping.external_id.is_empty(), "external identifier is empty");
        let write = self.store.upsert_mapping(&mapping).await?;
        if let MappingWrite::Conflict { existing } = &write {
            warn!(
                scope,
                entity_id,
                external_id = %mapping.external_id,
                owner = %existing.entity_id,
                existing_external = %existing.external_id,
                "explicit mapping rejected by existing claim"
            );
        }
        Ok(write)
    }
}

fn closest_identifiers(candidates: &[String], dataset: &Dataset<'_>) -> Vec<(String, f64)> {
    let mut scored: Vec<(String, f64)> = dataset
        .all_identifiers()
        .filter(|id| !id.trim().is_empty())
        .map(|id| {
            let normalized = normalize_identifier(id);
            let best = candidates
                .iter()
                .flat_map(|candidate| {
                    std::iter::once(jaro_winkler(candidate, &normalized)).chain(
                        split_segments(id)
                            .map(|segment| jaro_winkler(candidate, &normalize_identifier(segment))),
                    )
                })
                .fold(0.0_f64, f64::max);
            (id.to_string(), best)
        })
        .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(MAX_SUGGESTIONS);
    scored
}
