use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::db::{Inserter, Pruner};
use crate::error::{StoreError, StoreResult};
use crate::model::{Record, RecordToDelete};

/// A record as held by [`MemoryStore`], with its assigned identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record_id: i64,
    pub shard: i32,
    pub record: Record,
}

/// In-memory event store.
///
/// Records get increasing identifiers on insert and are spread over
/// `shards` by identifier. Failures can be injected per operation so the
/// pipelines can be exercised against a flaky backend.
#[derive(Debug)]
pub struct MemoryStore {
    shards: i32,
    next_id: AtomicI64,
    records: RwLock<BTreeMap<i64, StoredRecord>>,
    failing_inserts: AtomicUsize,
    failing_scans: AtomicUsize,
    failing_deletes: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryStore {
    pub fn new(shards: i32) -> Self {
        Self {
            shards: shards.max(1),
            next_id: AtomicI64::new(1),
            records: RwLock::new(BTreeMap::new()),
            failing_inserts: AtomicUsize::new(0),
            failing_scans: AtomicUsize::new(0),
            failing_deletes: AtomicUsize::new(0),
        }
    }

    pub fn shard_of(&self, record_id: i64) -> i32 {
        (record_id.rem_euclid(i64::from(self.shards))) as i32
    }

    /// Make the next `count` insert calls fail.
    pub fn fail_next_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` expiry scans fail.
    pub fn fail_next_scans(&self, count: usize) {
        self.failing_scans.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` deletes fail.
    pub fn fail_next_deletes(&self, count: usize) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn get(&self, record_id: i64) -> Option<StoredRecord> {
        self.records.read().await.get(&record_id).cloned()
    }

    pub async fn records(&self) -> Vec<StoredRecord> {
        self.records.read().await.values().cloned().collect()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Inserter for MemoryStore {
    async fn insert_records(&self, records: &[Record]) -> StoreResult<()> {
        if Self::take_failure(&self.failing_inserts) {
            return Err(StoreError::Unavailable("injected insert failure".to_string()));
        }

        let mut stored = self.records.write().await;
        for record in records {
            let record_id = self.next_id.fetch_add(1, Ordering::SeqCst);
            stored.insert(
                record_id,
                StoredRecord {
                    record_id,
                    shard: self.shard_of(record_id),
                    record: record.clone(),
                },
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Pruner for MemoryStore {
    async fn get_records_to_delete(
        &self,
        shard: i32,
        limit: usize,
        death_date: i64,
    ) -> StoreResult<Vec<RecordToDelete>> {
        if Self::take_failure(&self.failing_scans) {
            return Err(StoreError::Query("injected scan failure".to_string()));
        }

        let limit = if limit == 0 { usize::MAX } else { limit };
        let stored = self.records.read().await;
        Ok(stored
            .values()
            .filter(|r| r.shard == shard && r.record.death_date < death_date)
            .take(limit)
            .map(|r| RecordToDelete::new(r.record.death_date, r.record_id))
            .collect())
    }

    async fn delete_record(&self, shard: i32, death_date: i64, record_id: i64) -> StoreResult<()> {
        if Self::take_failure(&self.failing_deletes) {
            return Err(StoreError::Query("injected delete failure".to_string()));
        }

        let mut stored = self.records.write().await;
        // Deleting a row that is already gone affects nothing, like the SQL it stands in for.
        if stored
            .get(&record_id)
            .is_some_and(|r| r.shard == shard && r.record.death_date == death_date)
        {
            stored.remove(&record_id);
        }
        Ok(())
    }
}
