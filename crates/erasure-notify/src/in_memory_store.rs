use async_trait::async_trait;
use chrono::{DateTime, Utc};
use erasure_core::{
    BeginOutcome, CoreError, CoreResult, DedupRecord, DedupStats, DedupStatus, DedupStore,
    NotificationId,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// In-memory deduplication store.
///
/// Only safe for a single process: records vanish on restart and are not
/// visible to other instances. Used by tests and by `--store memory` for
/// local development.
pub struct InMemoryDedupStore {
    records: Mutex<HashMap<NotificationId, DedupRecord>>,
}

type Records = HashMap<NotificationId, DedupRecord>;

fn lock_records(mutex: &Mutex<Records>) -> CoreResult<MutexGuard<'_, Records>> {
    mutex
        .lock()
        .map_err(|e| CoreError::Storage(format!("lock poisoned: {}", e)))
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Number of records held (for testing/inspection).
    pub fn len(&self) -> usize {
        lock_records(&self.records).map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, id: &NotificationId, status: DedupStatus, reason: Option<&str>) -> CoreResult<()> {
        let mut records = lock_records(&self.records)?;
        let record = records
            .get_mut(id)
            .ok_or_else(|| CoreError::Storage(format!("no record for notification {}", id)))?;
        record.status = status;
        record.failure_reason = reason.map(str::to_string);
        record.updated_at = Utc::now();
        Ok(())
    }
}

impl Default for InMemoryDedupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn try_begin_processing(&self, id: &NotificationId) -> CoreResult<BeginOutcome> {
        let mut records = lock_records(&self.records)?;
        if records.contains_key(id) {
            return Ok(BeginOutcome::AlreadySeen);
        }
        let now = Utc::now();
        records.insert(
            id.clone(),
            DedupRecord {
                notification_id: id.clone(),
                first_seen_at: now,
                updated_at: now,
                status: DedupStatus::Pending,
                failure_reason: None,
            },
        );
        Ok(BeginOutcome::Started)
    }

    async fn mark_processed(&self, id: &NotificationId) -> CoreResult<()> {
        self.update(id, DedupStatus::Processed, None)
    }

    async fn mark_failed(&self, id: &NotificationId, reason: &str) -> CoreResult<()> {
        self.update(id, DedupStatus::Failed, Some(reason))
    }

    async fn release(&self, id: &NotificationId) -> CoreResult<bool> {
        let mut records = lock_records(&self.records)?;
        match records.get(id) {
            Some(r) if r.status == DedupStatus::Pending => {
                records.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: &NotificationId) -> CoreResult<Option<DedupRecord>> {
        Ok(lock_records(&self.records)?.get(id).cloned())
    }

    async fn prune_expired(&self, cutoff: DateTime<Utc>) -> CoreResult<u64> {
        let mut records = lock_records(&self.records)?;
        let before = records.len();
        records.retain(|_, r| r.first_seen_at >= cutoff);
        Ok((before - records.len()) as u64)
    }

    async fn stats(&self) -> CoreResult<DedupStats> {
        let records = lock_records(&self.records)?;
        let mut stats = DedupStats::default();
        for record in records.values() {
            match record.status {
                DedupStatus::Pending => stats.pending += 1,
                DedupStatus::Processed => stats.processed += 1,
                DedupStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
