//! Pipeline metrics
//!
//! Thread-safe counters and gauges for the insert, delete and retry paths,
//! backed by atomics so they can be updated from any task without locking.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::db::{OperationType, TYPE_LABEL};

pub const INSERTING_QUEUE_DEPTH: &str = "inserting_queue_depth";
pub const DROPPED_EVENTS_DB_FAIL_COUNTER: &str = "dropped_events_db_fail_count";
pub const DELETING_QUEUE_DEPTH: &str = "deleting_queue_depth";
pub const SQL_QUERY_RETRY_COUNTER: &str = "sql_query_retry_count";
pub const SQL_QUERY_END_COUNTER: &str = "sql_query_end_counter";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

/// Registration details for a metric, for exporters that need them up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDescriptor {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
    pub labels: &'static [&'static str],
}

/// Thread-safe metrics for the batch insert pipeline
#[derive(Debug, Clone, Default)]
pub struct InsertMetrics {
    inner: Arc<InsertMetricsInner>,
}

#[derive(Debug, Default)]
struct InsertMetricsInner {
    /// Records accepted but not yet pulled into a batch
    queue_depth: AtomicI64,
    /// Records lost because their batch insert failed
    dropped_records: AtomicU64,
    batches_dispatched: AtomicU64,
    records_inserted: AtomicU64,
}

impl InsertMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptors() -> Vec<MetricDescriptor> {
        vec![
            MetricDescriptor {
                name: INSERTING_QUEUE_DEPTH,
                help: "The depth of the insert queue",
                kind: MetricKind::Gauge,
                labels: &[],
            },
            MetricDescriptor {
                name: DROPPED_EVENTS_DB_FAIL_COUNTER,
                help: "The total number of events dropped from the database query failing",
                kind: MetricKind::Counter,
                labels: &[],
            },
        ]
    }

    pub fn record_enqueued(&self) {
        self.inner.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeued(&self) {
        self.inner.queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_batch_dispatched(&self) {
        self.inner.batches_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inserted(&self, count: usize) {
        self.inner
            .records_inserted
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: usize) {
        self.inner
            .dropped_records
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn queue_depth(&self) -> i64 {
        self.inner.queue_depth.load(Ordering::Relaxed)
    }

    pub fn dropped_records(&self) -> u64 {
        self.inner.dropped_records.load(Ordering::Relaxed)
    }

    pub fn batches_dispatched(&self) -> u64 {
        self.inner.batches_dispatched.load(Ordering::Relaxed)
    }

    pub fn records_inserted(&self) -> u64 {
        self.inner.records_inserted.load(Ordering::Relaxed)
    }
}

/// Thread-safe metrics for the batch delete pipeline
#[derive(Debug, Clone, Default)]
pub struct DeleteMetrics {
    inner: Arc<DeleteMetricsInner>,
}

#[derive(Debug, Default)]
struct DeleteMetricsInner {
    /// Identifiers waiting in the dedup set
    queue_depth: AtomicI64,
    scans: AtomicU64,
    scans_failed: AtomicU64,
    deletes_succeeded: AtomicU64,
    deletes_failed: AtomicU64,
}

impl DeleteMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptors() -> Vec<MetricDescriptor> {
        vec![MetricDescriptor {
            name: DELETING_QUEUE_DEPTH,
            help: "The depth of the delete queue",
            kind: MetricKind::Gauge,
            labels: &[],
        }]
    }

    pub fn record_enqueued(&self) {
        self.inner.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeued(&self) {
        self.inner.queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_scan(&self) {
        self.inner.scans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan_failure(&self) {
        self.inner.scans_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete_success(&self) {
        self.inner.deletes_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete_failure(&self) {
        self.inner.deletes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_depth(&self) -> i64 {
        self.inner.queue_depth.load(Ordering::Relaxed)
    }

    pub fn scans(&self) -> u64 {
        self.inner.scans.load(Ordering::Relaxed)
    }

    pub fn scans_failed(&self) -> u64 {
        self.inner.scans_failed.load(Ordering::Relaxed)
    }

    pub fn deletes_succeeded(&self) -> u64 {
        self.inner.deletes_succeeded.load(Ordering::Relaxed)
    }

    pub fn deletes_failed(&self) -> u64 {
        self.inner.deletes_failed.load(Ordering::Relaxed)
    }
}

/// A counter split by [`OperationType`].
#[derive(Debug, Default)]
pub struct LabeledCounter {
    values: [AtomicU64; OperationType::COUNT],
}

impl LabeledCounter {
    pub fn inc(&self, op: OperationType) {
        self.values[op.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, op: OperationType) -> u64 {
        self.values[op.index()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.values.iter().map(|v| v.load(Ordering::Relaxed)).sum()
    }
}

/// Thread-safe metrics for retried store queries
#[derive(Debug, Clone, Default)]
pub struct RetryMetrics {
    inner: Arc<RetryMetricsInner>,
}

#[derive(Debug, Default)]
struct RetryMetricsInner {
    retries: LabeledCounter,
    query_ends: LabeledCounter,
}

impl RetryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptors() -> Vec<MetricDescriptor> {
        vec![
            MetricDescriptor {
                name: SQL_QUERY_RETRY_COUNTER,
                help: "The total number of SQL queries retried",
                kind: MetricKind::Counter,
                labels: &[TYPE_LABEL],
            },
            MetricDescriptor {
                name: SQL_QUERY_END_COUNTER,
                help: "the total number of SQL queries that are done, no more retrying",
                kind: MetricKind::Counter,
                labels: &[TYPE_LABEL],
            },
        ]
    }

    pub fn record_retry(&self, op: OperationType) {
        self.inner.retries.inc(op);
    }

    pub fn record_query_end(&self, op: OperationType) {
        self.inner.query_ends.inc(op);
    }

    pub fn retries(&self, op: OperationType) -> u64 {
        self.inner.retries.get(op)
    }

    pub fn query_ends(&self, op: OperationType) -> u64 {
        self.inner.query_ends.get(op)
    }
}

/// Snapshot of all pipeline metrics at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSummary {
    pub inserting_queue_depth: i64,
    pub batches_dispatched: u64,
    pub records_inserted: u64,
    pub dropped_records: u64,
    pub deleting_queue_depth: i64,
    pub deletes_succeeded: u64,
    pub deletes_failed: u64,
    pub scans_failed: u64,
    pub insert_retries: u64,
    pub insert_query_ends: u64,
}

impl MetricsSummary {
    pub fn collect(insert: &InsertMetrics, delete: &DeleteMetrics, retry: &RetryMetrics) -> Self {
        Self {
            inserting_queue_depth: insert.queue_depth(),
            batches_dispatched: insert.batches_dispatched(),
            records_inserted: insert.records_inserted(),
            dropped_records: insert.dropped_records(),
            deleting_queue_depth: delete.queue_depth(),
            deletes_succeeded: delete.deletes_succeeded(),
            deletes_failed: delete.deletes_failed(),
            scans_failed: delete.scans_failed(),
            insert_retries: retry.retries(OperationType::Insert),
            insert_query_ends: retry.query_ends(OperationType::Insert),
        }
    }

    pub fn log(&self) {
        tracing::info!(
            queue_depth = self.inserting_queue_depth,
            batches = self.batches_dispatched,
            inserted = self.records_inserted,
            dropped = self.dropped_records,
            "insert pipeline"
        );
        tracing::info!(
            queue_depth = self.deleting_queue_depth,
            deleted = self.deletes_succeeded,
            failed = self.deletes_failed,
            failed_scans = self.scans_failed,
            "delete pipeline"
        );
        tracing::info!(
            retries = self.insert_retries,
            completed = self.insert_query_ends,
            "insert retries"
        );
    }
}

/// Every metric this workspace emits.
pub fn all_descriptors() -> Vec<MetricDescriptor> {
    let mut all = InsertMetrics::descriptors();
    all.extend(DeleteMetrics::descriptors());
    all.extend(RetryMetrics::descriptors());
    all
}
