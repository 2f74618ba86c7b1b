//! Last-success bookkeeping per sync target.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use shiftsync_core::TriggerKind;
use tokio::sync::RwLock;

use crate::config::FreshnessPolicy;
use crate::store::SyncStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuccessStats {
    pub rows_affected: u64,
    pub entities_synced: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub at: DateTime<Utc>,
    pub stats: SuccessStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A successful sync finished within the trigger's minimum interval.
    Fresh {
        last_success: DateTime<Utc>,
        min_interval: Duration,
    },
    /// Another sync of the same target is running.
    AlreadyInProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncDecision {
    Proceed,
    Skip(SkipReason),
}

/// Last successful sync per target.
///
/// Every read consults the record store, so successes written by another process
/// show up here. Successes recorded locally act as a floor: the entry never moves
/// backwards.
pub struct FreshnessLedger {
    policy: FreshnessPolicy,
    store: Arc<dyn SyncStore>,
    entries: RwLock<HashMap<String, LedgerEntry>>,
}

impl FreshnessLedger {
    pub fn new(policy: FreshnessPolicy, store: Arc<dyn SyncStore>) -> Self {
        Self {
            policy,
            store,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn last_success(&self, target_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.entry(target_id).await?.map(|e| e.at))
    }

    pub async fn entry(&self, target_id: &str) -> Result<Option<LedgerEntry>> {
        let stored = self
            .store
            .last_success(target_id)
            .await?
            .and_then(|record| {
                record.finished_at.map(|at| LedgerEntry {
                    at,
                    stats: SuccessStats {
                        rows_affected: record.rows_affected,
                        entities_synced: record.entities_synced,
                    },
                })
            });
        if let Some(entry) = stored {
            self.remember(target_id, entry).await;
        }
        Ok(self.entries.read().await.get(target_id).copied())
    }

    pub async fn record_success(&self, target_id: &str, at: DateTime<Utc>, stats: SuccessStats) {
        self.remember(target_id, LedgerEntry { at, stats }).await;
    }

    async fn remember(&self, target_id: &str, entry: LedgerEntry) {
        let mut entries = self.entries.write().await;
        match entries.get(target_id) {
            Some(current) if current.at >= entry.at => {}
            _ => {
                entries.insert(target_id.to_string(), entry);
            }
        }
    }

    /// True when the last success is younger than the trigger's minimum interval.
    pub async fn is_fresh(
        &self,
        target_id: &str,
        trigger: TriggerKind,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(last) = self.last_success(target_id).await? else {
            return Ok(false);
        };
        Ok(within(now, last, self.policy.min_interval(trigger)))
    }

    pub async fn decide(
        &self,
        target_id: &str,
        trigger: TriggerKind,
        force: bool,
    ) -> Result<SyncDecision> {
        self.decide_at(target_id, trigger, force, Utc::now()).await
    }

    pub async fn decide_at(
        &self,
        target_id: &str,
        trigger: TriggerKind,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<SyncDecision> {
        if force {
            return Ok(SyncDecision::Proceed);
        }
        let min_interval = self.policy.min_interval(trigger);
        match self.last_success(target_id).await? {
            Some(last_success) if within(now, last_success, min_interval) => {
                Ok(SyncDecision::Skip(SkipReason::Fresh {
                    last_success,
                    min_interval,
                }))
            }
            _ => Ok(SyncDecision::Proceed),
        }
    }
}

fn within(now: DateTime<Utc>, last: DateTime<Utc>, interval: Duration) -> bool {
    match (now - last).to_std() {
        Ok(age) => age < interval,
        // Clock skew: a success stamped in the future counts as fresh.
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SyncRecordStore};
    use chrono::TimeZone;
    use shiftsync_core::{SyncRecord, SyncStatus};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn memory_ledger() -> FreshnessLedger {
        FreshnessLedger::new(FreshnessPolicy::default(), Arc::new(MemoryStore::new()))
    }

    fn succeeded(at: DateTime<Utc>, rows_affected: u64) -> SyncRecord {
        let mut record = SyncRecord::begin("t1", TriggerKind::Periodic, None, at);
        record.status = SyncStatus::Success;
        record.finished_at = Some(at);
        record.rows_affected = rows_affected;
        record
    }

    #[tokio::test]
    async fn periodic_trigger_honours_daily_interval() {
        let ledger = memory_ledger();
        let t = now();
        assert_eq!(
            ledger.decide_at("t1", TriggerKind::Periodic, false, t).await.unwrap(),
            SyncDecision::Proceed
        );

        ledger
            .record_success("t1", t - chrono::Duration::hours(1), SuccessStats::default())
            .await;
        assert!(matches!(
            ledger.decide_at("t1", TriggerKind::Periodic, false, t).await.unwrap(),
            SyncDecision::Skip(SkipReason::Fresh { .. })
        ));
        assert_eq!(
            ledger.decide_at("t1", TriggerKind::Periodic, true, t).await.unwrap(),
            SyncDecision::Proceed
        );

        let other = memory_ledger();
        other
            .record_success("t1", t - chrono::Duration::hours(25), SuccessStats::default())
            .await;
        assert_eq!(
            other.decide_at("t1", TriggerKind::Periodic, false, t).await.unwrap(),
            SyncDecision::Proceed
        );
    }

    #[tokio::test]
    async fn interactive_interval_is_shorter() {
        let ledger = memory_ledger();
        let t = now();
        ledger
            .record_success("t1", t - chrono::Duration::minutes(45), SuccessStats::default())
            .await;
        assert!(!ledger.is_fresh("t1", TriggerKind::Interactive, t).await.unwrap());
        assert!(ledger.is_fresh("t1", TriggerKind::Periodic, t).await.unwrap());
    }

    #[tokio::test]
    async fn ledger_hydrates_from_records_and_never_moves_backwards() {
        let store = Arc::new(MemoryStore::new());
        let t = now();
        store.begin_record(&succeeded(t - chrono::Duration::hours(2), 12)).await.unwrap();

        let ledger = FreshnessLedger::new(FreshnessPolicy::default(), store);
        let entry = ledger.entry("t1").await.unwrap().unwrap();
        assert_eq!(entry.stats.rows_affected, 12);

        ledger
            .record_success("t1", t - chrono::Duration::hours(5), SuccessStats::default())
            .await;
        assert_eq!(
            ledger.last_success("t1").await.unwrap(),
            Some(t - chrono::Duration::hours(2))
        );
    }

    #[tokio::test]
    async fn successes_written_by_a_peer_are_picked_up() {
        let store = Arc::new(MemoryStore::new());
        let t = now();
        store.begin_record(&succeeded(t - chrono::Duration::hours(30), 12)).await.unwrap();

        let ledger = FreshnessLedger::new(FreshnessPolicy::default(), store.clone());
        assert_eq!(
            ledger.decide_at("t1", TriggerKind::Periodic, false, t).await.unwrap(),
            SyncDecision::Proceed
        );

        // Another process sharing the store finishes a sync.
        store.begin_record(&succeeded(t - chrono::Duration::hours(1), 7)).await.unwrap();
        let entry = ledger.entry("t1").await.unwrap().unwrap();
        assert_eq!(entry.at, t - chrono::Duration::hours(1));
        assert_eq!(entry.stats.rows_affected, 7);
        assert!(matches!(
            ledger.decide_at("t1", TriggerKind::Periodic, false, t).await.unwrap(),
            SyncDecision::Skip(SkipReason::Fresh { .. })
        ));
    }
}
