//! Persistence seams for the sync engine and the in-process implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use shiftsync_core::{
    CachedRow, DateRange, DiscoverySource, IdentityMapping, InternalEntity, SyncRecord, SyncStatus,
};
use tokio::sync::{Mutex, RwLock};

/// Outcome of writing an identity mapping. Conflicts are not faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingWrite {
    Inserted,
    /// Same mapping already present; verification time refreshed.
    Refreshed,
    /// Another mapping in the scope already claims the external id or the entity.
    Conflict { existing: IdentityMapping },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceStats {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub deleted: u64,
}

impl ReplaceStats {
    pub fn affected(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

#[async_trait]
pub trait EntityDirectory: Send + Sync {
    /// Internal entities that may appear in a target's sheets.
    async fn list_entities(&self, target_id: &str) -> Result<Vec<InternalEntity>>;
}

#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn find_mapping_for_entity(
        &self,
        scope: &str,
        entity_id: &str,
    ) -> Result<Option<IdentityMapping>>;

    async fn find_mapping_for_external(
        &self,
        scope: &str,
        external_id: &str,
    ) -> Result<Option<IdentityMapping>>;

    /// Idempotent upsert keyed by `(scope, external_id)`; never reassigns an entity.
    async fn upsert_mapping(&self, mapping: &IdentityMapping) -> Result<MappingWrite>;

    async fn list_mappings(&self, scope: &str) -> Result<Vec<IdentityMapping>>;
}

#[async_trait]
pub trait CachedRowStore: Send + Sync {
    /// Makes `rows` the content of `range` for `entity_ids` in `target_id`.
    ///
    /// Upserts first, then deletes in-range dates of those entities that are no
    /// longer present. Rows outside the range, or of other entities, are untouched.
    async fn replace_rows(
        &self,
        target_id: &str,
        range: DateRange,
        entity_ids: &[String],
        rows: &[CachedRow],
    ) -> Result<ReplaceStats>;

    async fn query_rows(
        &self,
        target_id: &str,
        entity_id: Option<&str>,
        range: Option<DateRange>,
    ) -> Result<Vec<CachedRow>>;
}

#[async_trait]
pub trait SyncRecordStore: Send + Sync {
    async fn begin_record(&self, record: &SyncRecord) -> Result<()>;

    /// Writes a terminal record over its in-progress row. Returns false if the
    /// stored record was already terminal.
    async fn finish_record(&self, record: &SyncRecord) -> Result<bool>;

    /// Newest first.
    async fn list_records(&self, target_id: &str, limit: usize) -> Result<Vec<SyncRecord>>;

    async fn last_success(&self, target_id: &str) -> Result<Option<SyncRecord>>;
}

pub trait SyncStore: EntityDirectory + MappingStore + CachedRowStore + SyncRecordStore {}

impl<T> SyncStore for T where
    T: EntityDirectory + MappingStore + CachedRowStore + SyncRecordStore
{
}

type RowKey = (String, String, NaiveDate);

/// Process-local store with the same uniqueness rules as the database schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: RwLock<HashMap<String, Vec<InternalEntity>>>,
    mappings: RwLock<Vec<IdentityMapping>>,
    rows: Mutex<BTreeMap<RowKey, CachedRow>>,
    records: RwLock<Vec<SyncRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_entities(&self, target_id: &str, entities: Vec<InternalEntity>) {
        self.entities
            .write()
            .await
            .insert(target_id.to_string(), entities);
    }
}

#[async_trait]
impl EntityDirectory for MemoryStore {
    async fn list_entities(&self, target_id: &str) -> Result<Vec<InternalEntity>> {
        Ok(self
            .entities
            .read()
            .await
            .get(target_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl MappingStore for MemoryStore {
    async fn find_mapping_for_entity(
        &self,
        scope: &str,
        entity_id: &str,
    ) -> Result<Option<IdentityMapping>> {
        Ok(self
            .mappings
            .read()
            .await
            .iter()
            .find(|m| m.scope == scope && m.entity_id == entity_id)
            .cloned())
    }

    async fn find_mapping_for_external(
        &self,
        scope: &str,
        external_id: &str,
    ) -> Result<Option<IdentityMapping>> {
        Ok(self
            .mappings
            .read()
            .await
            .iter()
            .find(|m| m.scope == scope && m.external_id == external_id)
            .cloned())
    }

    async fn upsert_mapping(&self, mapping: &IdentityMapping) -> Result<MappingWrite> {
        let mut mappings = self.mappings.write().await;
        let existing = mappings.iter_mut().find(|m| {
            m.scope == mapping.scope
                && (m.external_id == mapping.external_id || m.entity_id == mapping.entity_id)
        });
        match existing {
            Some(m) if m.external_id == mapping.external_id && m.entity_id == mapping.entity_id => {
                m.last_verified_at = mapping.last_verified_at;
                m.raw_external = mapping.raw_external.clone();
                if mapping.source == DiscoverySource::Explicit {
                    m.source = DiscoverySource::Explicit;
                }
                Ok(MappingWrite::Refreshed)
            }
            Some(m) => Ok(MappingWrite::Conflict { existing: m.clone() }),
            None => {
                mappings.push(mapping.clone());
                Ok(MappingWrite::Inserted)
            }
        }
    }

    async fn list_mappings(&self, scope: &str) -> Result<Vec<IdentityMapping>> {
        let mut out: Vec<_> = self
            .mappings
            .read()
            .await
            .iter()
            .filter(|m| m.scope == scope)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        Ok(out)
    }
}

#[async_trait]
impl CachedRowStore for MemoryStore {
    async fn replace_rows(
        &self,
        target_id: &str,
        range: DateRange,
        entity_ids: &[String],
        rows: &[CachedRow],
    ) -> Result<ReplaceStats> {
        let mut stored = self.rows.lock().await;
        let mut stats = ReplaceStats::default();
        let mut keep: BTreeSet<RowKey> = BTreeSet::new();

        for row in rows.iter().filter(|r| r.target_id == target_id && range.contains(r.date)) {
            let key = (row.target_id.clone(), row.entity_id.clone(), row.date);
            keep.insert(key.clone());
            match stored.get_mut(&key) {
                Some(existing) if existing.same_content(row) => stats.unchanged += 1,
                Some(existing) => {
                    *existing = row.clone();
                    stats.updated += 1;
                }
                None => {
                    stored.insert(key, row.clone());
                    stats.inserted += 1;
                }
            }
        }

        for entity_id in entity_ids {
            let lo = (target_id.to_string(), entity_id.clone(), range.start);
            let hi = (target_id.to_string(), entity_id.clone(), range.end);
            let stale: Vec<RowKey> = stored
                .range(lo..=hi)
                .map(|(key, _)| key.clone())
                .filter(|key| !keep.contains(key))
                .collect();
            for key in stale {
                stored.remove(&key);
                stats.deleted += 1;
            }
        }

        Ok(stats)
    }

    async fn query_rows(
        &self,
        target_id: &str,
        entity_id: Option<&str>,
        range: Option<DateRange>,
    ) -> Result<Vec<CachedRow>> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .filter(|r| r.target_id == target_id)
            .filter(|r| entity_id.map_or(true, |id| r.entity_id == id))
            .filter(|r| range.map_or(true, |range| range.contains(r.date)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SyncRecordStore for MemoryStore {
    async fn begin_record(&self, record: &SyncRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn finish_record(&self, record: &SyncRecord) -> Result<bool> {
        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.record_id == record.record_id) {
            Some(stored) if stored.status == SyncStatus::InProgress => {
                *stored = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_records(&self, target_id: &str, limit: usize) -> Result<Vec<SyncRecord>> {
        let mut out: Vec<_> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.target_id == target_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn last_success(&self, target_id: &str) -> Result<Option<SyncRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.target_id == target_id && r.status == SyncStatus::Success)
            .max_by_key(|r| r.finished_at)
            .cloned())
    }
}
