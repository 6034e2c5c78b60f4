//! Test doubles for the store contracts.
//!
//! Available with the `testing` feature or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! common = { path = "../common", features = ["testing"] }
//! ```
//!
//! Each double records what it was asked to do and tracks how many calls
//! were in flight at once. A double built with [`Gate`] holds every call
//! until the test releases it, which lets tests observe concurrency limits.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::db::{Inserter, Pruner, TimeTracker};
use crate::error::{StoreError, StoreResult};
use crate::model::{Record, RecordToDelete};

/// Holds calls until the test lets them through.
#[derive(Debug, Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Gate {
    pub fn closed() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    /// Let `count` waiting or future calls through.
    pub fn release(&self, count: usize) {
        self.permits.add_permits(count);
    }

    /// Let every call through from now on.
    pub fn open(&self) {
        self.permits.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    async fn pass(&self) {
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}

/// Tracks current and peak number of concurrent calls.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Inserter that remembers every batch it is given.
#[derive(Debug, Default)]
pub struct RecordingInserter {
    batches: Mutex<Vec<Vec<Record>>>,
    failing: AtomicBool,
    gate: Option<Gate>,
    probe: ConcurrencyProbe,
}

impl RecordingInserter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with [`StoreError::Unavailable`].
    pub fn failing() -> Self {
        let inserter = Self::default();
        inserter.set_failing(true);
        inserter
    }

    /// Every call waits on `gate` before returning.
    pub fn gated(gate: Gate) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Batches in the order their calls started.
    pub fn batches(&self) -> Vec<Vec<Record>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls(&self) -> usize {
        self.batches.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn total_records(&self) -> usize {
        self.batches().iter().map(Vec::len).sum()
    }

    pub fn probe(&self) -> &ConcurrencyProbe {
        &self.probe
    }
}

#[async_trait]
impl Inserter for RecordingInserter {
    async fn insert_records(&self, records: &[Record]) -> StoreResult<()> {
        self.probe.enter();
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(records.to_vec());

        if let Some(gate) = &self.gate {
            gate.pass().await;
        }
        self.probe.exit();

        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("recording inserter set to fail".to_string()))
        } else {
            Ok(())
        }
    }
}

/// A scan as seen by [`RecordingPruner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCall {
    pub shard: i32,
    pub limit: usize,
    pub death_date: i64,
}

/// A delete as seen by [`RecordingPruner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteCall {
    pub shard: i32,
    pub death_date: i64,
    pub record_id: i64,
}

/// Pruner that answers every scan with the same expired records and
/// remembers each call.
#[derive(Debug, Default)]
pub struct RecordingPruner {
    expired: Mutex<Vec<RecordToDelete>>,
    scans: Mutex<Vec<ScanCall>>,
    deletes: Mutex<Vec<DeleteCall>>,
    failing_scans: AtomicBool,
    failing_deletes: AtomicBool,
    gate: Option<Gate>,
    probe: ConcurrencyProbe,
}

impl RecordingPruner {
    pub fn new(expired: Vec<RecordToDelete>) -> Self {
        Self {
            expired: Mutex::new(expired),
            ..Self::default()
        }
    }

    /// Every delete waits on `gate` before returning.
    pub fn gated(expired: Vec<RecordToDelete>, gate: Gate) -> Self {
        Self {
            expired: Mutex::new(expired),
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn set_expired(&self, expired: Vec<RecordToDelete>) {
        *self.expired.lock().unwrap_or_else(|e| e.into_inner()) = expired;
    }

    pub fn set_failing_scans(&self, failing: bool) {
        self.failing_scans.store(failing, Ordering::SeqCst);
    }

    pub fn set_failing_deletes(&self, failing: bool) {
        self.failing_deletes.store(failing, Ordering::SeqCst);
    }

    pub fn scans(&self) -> Vec<ScanCall> {
        self.scans.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Deletes in the order their calls started.
    pub fn deletes(&self) -> Vec<DeleteCall> {
        self.deletes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn probe(&self) -> &ConcurrencyProbe {
        &self.probe
    }
}

#[async_trait]
impl Pruner for RecordingPruner {
    async fn get_records_to_delete(
        &self,
        shard: i32,
        limit: usize,
        death_date: i64,
    ) -> StoreResult<Vec<RecordToDelete>> {
        self.scans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ScanCall {
                shard,
                limit,
                death_date,
            });

        if self.failing_scans.load(Ordering::SeqCst) {
            return Err(StoreError::Query("recording pruner set to fail scans".to_string()));
        }

        let expired = self.expired.lock().unwrap_or_else(|e| e.into_inner());
        let limit = if limit == 0 { expired.len() } else { limit };
        Ok(expired.iter().take(limit).copied().collect())
    }

    async fn delete_record(&self, shard: i32, death_date: i64, record_id: i64) -> StoreResult<()> {
        self.probe.enter();
        self.deletes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(DeleteCall {
                shard,
                death_date,
                record_id,
            });

        if let Some(gate) = &self.gate {
            gate.pass().await;
        }
        self.probe.exit();

        if self.failing_deletes.load(Ordering::SeqCst) {
            Err(StoreError::Query("recording pruner set to fail deletes".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Time tracker that keeps every latency it is given.
#[derive(Debug, Default)]
pub struct RecordingTracker {
    samples: Mutex<Vec<Duration>>,
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<Duration> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl TimeTracker for RecordingTracker {
    fn track_time(&self, elapsed: Duration) {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(elapsed);
    }
}

/// Records with `count` distinct device ids and a small payload.
pub fn sample_records(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| Record {
            device_id: format!("device-{i}"),
            birth_date: 1_000 + i as i64,
            death_date: 2_000 + i as i64,
            data: format!("event {i}").into_bytes(),
            ..Record::default()
        })
        .collect()
}

/// Poll `condition` until it holds, yielding to other tasks in between.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
