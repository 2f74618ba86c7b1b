//! Postgres implementation of the sync stores.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use shiftsync_core::{
    CacheEntry, CacheKey, CachedRow, DateRange, IdentityMapping, InternalEntity, SheetError,
    SyncRecord,
};
use shiftsync_storage::SnapshotBackend;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::store::{
    CachedRowStore, EntityDirectory, MappingStore, MappingWrite, ReplaceStats, SyncRecordStore,
};

const MAPPING_COLUMNS: &str = "mapping_id, scope, external_id, raw_external, entity_id, \
    source, tier, created_at, last_verified_at";

const RECORD_COLUMNS: &str = "record_id, target_id, status, trigger_kind, triggered_by, \
    started_at, finished_at, duration_ms, rows_affected, entities_synced, entities_unmatched, \
    error, sheet_errors";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Upserts directory entries for a target; returns rows written.
    pub async fn seed_entities(&self, target_id: &str, entities: &[InternalEntity]) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("starting entity seed")?;
        let mut written = 0;
        for entity in entities {
            written += sqlx::query(
                r#"
                INSERT INTO sync_entities (target_id, entity_id, username, full_name, role)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (target_id, entity_id) DO UPDATE
                   SET username = EXCLUDED.username,
                       full_name = EXCLUDED.full_name,
                       role = EXCLUDED.role
                "#,
            )
            .bind(target_id)
            .bind(&entity.id)
            .bind(&entity.username)
            .bind(entity.full_name.as_deref())
            .bind(entity.role.as_str())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("seeding entity {}", entity.id))?
            .rows_affected();
        }
        tx.commit().await.context("committing entity seed")?;
        Ok(written)
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn mapping_from_row(row: &PgRow) -> Result<IdentityMapping> {
    let source: String = row.try_get("source")?;
    let tier: String = row.try_get("tier")?;
    Ok(IdentityMapping {
        mapping_id: row.try_get("mapping_id")?,
        scope: row.try_get("scope")?,
        external_id: row.try_get("external_id")?,
        raw_external: row.try_get("raw_external")?,
        entity_id: row.try_get("entity_id")?,
        source: source.parse().map_err(anyhow::Error::msg)?,
        tier: tier.parse().map_err(anyhow::Error::msg)?,
        created_at: row.try_get("created_at")?,
        last_verified_at: row.try_get("last_verified_at")?,
    })
}

fn record_from_row(row: &PgRow) -> Result<SyncRecord> {
    let status: String = row.try_get("status")?;
    let trigger: String = row.try_get("trigger_kind")?;
    let sheet_errors: Json<Vec<SheetError>> = row.try_get("sheet_errors")?;
    Ok(SyncRecord {
        record_id: row.try_get("record_id")?,
        target_id: row.try_get("target_id")?,
        status: status.parse().map_err(anyhow::Error::msg)?,
        trigger: trigger.parse().map_err(anyhow::Error::msg)?,
        triggered_by: row.try_get("triggered_by")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_ms: row.try_get("duration_ms")?,
        rows_affected: to_u64(row.try_get("rows_affected")?),
        entities_synced: to_u64(row.try_get("entities_synced")?),
        entities_unmatched: to_u64(row.try_get("entities_unmatched")?),
        error: row.try_get("error")?,
        sheet_errors: sheet_errors.0,
    })
}

#[async_trait]
impl EntityDirectory for PgStore {
    async fn list_entities(&self, target_id: &str) -> Result<Vec<InternalEntity>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, username, full_name, role
              FROM sync_entities
             WHERE target_id = $1
             ORDER BY entity_id
            "#,
        )
        .bind(target_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing entities for {target_id}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let role: String = row.try_get("role")?;
            out.push(InternalEntity {
                id: row.try_get("entity_id")?,
                username: row.try_get("username")?,
                full_name: row.try_get("full_name")?,
                role: role.parse().map_err(anyhow::Error::msg)?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl MappingStore for PgStore {
    async fn find_mapping_for_entity(
        &self,
        scope: &str,
        entity_id: &str,
    ) -> Result<Option<IdentityMapping>> {
        let row = sqlx::query(&format!(
            "SELECT {MAPPING_COLUMNS} FROM identity_mappings WHERE scope = $1 AND entity_id = $2"
        ))
        .bind(scope)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading mapping by entity")?;
        row.as_ref().map(mapping_from_row).transpose()
    }

    async fn find_mapping_for_external(
        &self,
        scope: &str,
        external_id: &str,
    ) -> Result<Option<IdentityMapping>> {
        let row = sqlx::query(&format!(
            "SELECT {MAPPING_COLUMNS} FROM identity_mappings WHERE scope = $1 AND external_id = $2"
        ))
        .bind(scope)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading mapping by external id")?;
        row.as_ref().map(mapping_from_row).transpose()
    }

    async fn upsert_mapping(&self, mapping: &IdentityMapping) -> Result<MappingWrite> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO identity_mappings ({MAPPING_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT DO NOTHING
            "#
        ))
        .bind(mapping.mapping_id)
        .bind(&mapping.scope)
        .bind(&mapping.external_id)
        .bind(&mapping.raw_external)
        .bind(&mapping.entity_id)
        .bind(mapping.source.as_str())
        .bind(mapping.tier.as_str())
        .bind(mapping.created_at)
        .bind(mapping.last_verified_at)
        .execute(&self.pool)
        .await
        .context("inserting identity mapping")?
        .rows_affected();
        if inserted == 1 {
            return Ok(MappingWrite::Inserted);
        }

        let existing = sqlx::query(&format!(
            r#"
            SELECT {MAPPING_COLUMNS}
              FROM identity_mappings
             WHERE scope = $1 AND (external_id = $2 OR entity_id = $3)
             ORDER BY (external_id = $2) DESC
             LIMIT 1
            "#
        ))
        .bind(&mapping.scope)
        .bind(&mapping.external_id)
        .bind(&mapping.entity_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading conflicting identity mapping")?;
        let existing = existing
            .as_ref()
            .map(mapping_from_row)
            .transpose()?
            .ok_or_else(|| {
                anyhow!("identity mapping {} vanished during upsert", mapping.external_id)
            })?;

        if existing.external_id != mapping.external_id || existing.entity_id != mapping.entity_id {
            return Ok(MappingWrite::Conflict { existing });
        }

        sqlx::query(
            r#"
            UPDATE identity_mappings
               SET last_verified_at = $2,
                   raw_external = $3,
                   source = CASE WHEN $4 = 'explicit' THEN 'explicit' ELSE source END
             WHERE mapping_id = $1
            "#,
        )
        .bind(existing.mapping_id)
        .bind(mapping.last_verified_at)
        .bind(&mapping.raw_external)
        .bind(mapping.source.as_str())
        .execute(&self.pool)
        .await
        .context("refreshing identity mapping")?;
        Ok(MappingWrite::Refreshed)
    }

    async fn list_mappings(&self, scope: &str) -> Result<Vec<IdentityMapping>> {
        let rows = sqlx::query(&format!(
            "SELECT {MAPPING_COLUMNS} FROM identity_mappings WHERE scope = $1 ORDER BY external_id"
        ))
        .bind(scope)
        .fetch_all(&self.pool)
        .await
        .context("listing identity mappings")?;
        rows.iter().map(mapping_from_row).collect()
    }
}

#[async_trait]
impl CachedRowStore for PgStore {
    async fn replace_rows(
        &self,
        target_id: &str,
        range: DateRange,
        entity_ids: &[String],
        rows: &[CachedRow],
    ) -> Result<ReplaceStats> {
        let mut tx = self.pool.begin().await.context("starting row replacement")?;
        let mut stats = ReplaceStats::default();
        let mut kept_entities = Vec::new();
        let mut kept_dates: Vec<NaiveDate> = Vec::new();

        for row in rows.iter().filter(|r| r.target_id == target_id && range.contains(r.date)) {
            kept_entities.push(row.entity_id.clone());
            kept_dates.push(row.date);
            // xmax = 0 only for freshly inserted tuples.
            let written: Option<bool> = sqlx::query_scalar(
                r#"
                INSERT INTO cached_rows (target_id, entity_id, date, category, value, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (target_id, entity_id, date) DO UPDATE
                   SET category = EXCLUDED.category,
                       value = EXCLUDED.value,
                       updated_at = EXCLUDED.updated_at
                 WHERE cached_rows.category IS DISTINCT FROM EXCLUDED.category
                    OR cached_rows.value IS DISTINCT FROM EXCLUDED.value
                RETURNING (xmax = 0)
                "#,
            )
            .bind(target_id)
            .bind(&row.entity_id)
            .bind(row.date)
            .bind(&row.category)
            .bind(&row.value)
            .bind(row.updated_at)
            .fetch_optional(&mut *tx)
            .await
            .context("upserting cached row")?;
            match written {
                Some(true) => stats.inserted += 1,
                Some(false) => stats.updated += 1,
                None => stats.unchanged += 1,
            }
        }

        if !entity_ids.is_empty() {
            stats.deleted = sqlx::query(
                r#"
                DELETE FROM cached_rows
                 WHERE target_id = $1
                   AND entity_id = ANY($2)
                   AND date BETWEEN $3 AND $4
                   AND (entity_id, date) NOT IN (
                        SELECT k.entity_id, k.date
                          FROM UNNEST($5::text[], $6::date[]) AS k(entity_id, date)
                   )
                "#,
            )
            .bind(target_id)
            .bind(entity_ids)
            .bind(range.start)
            .bind(range.end)
            .bind(&kept_entities)
            .bind(&kept_dates)
            .execute(&mut *tx)
            .await
            .context("deleting replaced cached rows")?
            .rows_affected();
        }

        tx.commit().await.context("committing row replacement")?;
        Ok(stats)
    }

    async fn query_rows(
        &self,
        target_id: &str,
        entity_id: Option<&str>,
        range: Option<DateRange>,
    ) -> Result<Vec<CachedRow>> {
        let rows = sqlx::query(
            r#"
            SELECT target_id, entity_id, date, category, value, updated_at
              FROM cached_rows
             WHERE target_id = $1
               AND ($2::text IS NULL OR entity_id = $2)
               AND ($3::date IS NULL OR date >= $3)
               AND ($4::date IS NULL OR date <= $4)
             ORDER BY entity_id, date
            "#,
        )
        .bind(target_id)
        .bind(entity_id)
        .bind(range.map(|r| r.start))
        .bind(range.map(|r| r.end))
        .fetch_all(&self.pool)
        .await
        .context("querying cached rows")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(CachedRow {
                target_id: row.try_get("target_id")?,
                entity_id: row.try_get("entity_id")?,
                date: row.try_get("date")?,
                category: row.try_get("category")?,
                value: row.try_get("value")?,
                updated_at: row.try_get("updated_at")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl SyncRecordStore for PgStore {
    async fn begin_record(&self, record: &SyncRecord) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO sync_records ({RECORD_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#
        ))
        .bind(record.record_id)
        .bind(&record.target_id)
        .bind(record.status.as_str())
        .bind(record.trigger.as_str())
        .bind(record.triggered_by.as_deref())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.duration_ms)
        .bind(to_i64(record.rows_affected))
        .bind(to_i64(record.entities_synced))
        .bind(to_i64(record.entities_unmatched))
        .bind(record.error.as_deref())
        .bind(Json(&record.sheet_errors))
        .execute(&self.pool)
        .await
        .context("inserting sync record")?;
        Ok(())
    }

    async fn finish_record(&self, record: &SyncRecord) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE sync_records
               SET status = $2,
                   finished_at = $3,
                   duration_ms = $4,
                   rows_affected = $5,
                   entities_synced = $6,
                   entities_unmatched = $7,
                   error = $8,
                   sheet_errors = $9
             WHERE record_id = $1
               AND status = 'in_progress'
            "#,
        )
        .bind(record.record_id)
        .bind(record.status.as_str())
        .bind(record.finished_at)
        .bind(record.duration_ms)
        .bind(to_i64(record.rows_affected))
        .bind(to_i64(record.entities_synced))
        .bind(to_i64(record.entities_unmatched))
        .bind(record.error.as_deref())
        .bind(Json(&record.sheet_errors))
        .execute(&self.pool)
        .await
        .context("finishing sync record")?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn list_records(&self, target_id: &str, limit: usize) -> Result<Vec<SyncRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
              FROM sync_records
             WHERE target_id = $1
             ORDER BY started_at DESC
             LIMIT $2
            "#
        ))
        .bind(target_id)
        .bind(to_i64(limit as u64))
        .fetch_all(&self.pool)
        .await
        .context("listing sync records")?;
        rows.iter().map(record_from_row).collect()
    }

    async fn last_success(&self, target_id: &str) -> Result<Option<SyncRecord>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
              FROM sync_records
             WHERE target_id = $1 AND status = 'success'
             ORDER BY finished_at DESC
             LIMIT 1
            "#
        ))
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading last successful sync")?;
        row.as_ref().map(record_from_row).transpose()
    }
}

#[async_trait]
impl SnapshotBackend for PgStore {
    async fn save(&self, entry: &CacheEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sheet_cache (document_id, sheet_key, entry, stored_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (document_id, sheet_key) DO UPDATE
               SET entry = EXCLUDED.entry,
                   stored_at = EXCLUDED.stored_at,
                   expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&entry.key.document_id)
        .bind(&entry.key.sheet_key)
        .bind(Json(entry))
        .bind(entry.stored_at)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await
        .context("saving sheet cache entry")?;
        Ok(())
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            "SELECT entry FROM sheet_cache WHERE document_id = $1 AND sheet_key = $2",
        )
        .bind(&key.document_id)
        .bind(&key.sheet_key)
        .fetch_optional(&self.pool)
        .await
        .context("loading sheet cache entry")?;
        match row {
            Some(row) => {
                let entry: Json<CacheEntry> = row.try_get("entry")?;
                Ok(Some(entry.0))
            }
            None => Ok(None),
        }
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM sheet_cache WHERE expires_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("purging sheet cache")?
            .rows_affected();
        Ok(deleted)
    }
}
