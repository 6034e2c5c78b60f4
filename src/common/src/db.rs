//! Contracts between the batching pipelines and a storage backend.
//!
//! Backends only need to implement [`Inserter`] to receive batched writes and
//! [`Pruner`] to take part in expiry-driven deletes. Wrappers such as the
//! retry service implement the same traits, so they can be stacked in front
//! of a backend without the pipelines noticing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::model::{Record, RecordToDelete};

/// Label key used on metrics that are split by query type.
pub const TYPE_LABEL: &str = "type";

/// Kind of store operation, used to label counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Insert,
    Delete,
    Read,
    Ping,
    BlacklistRead,
}

impl OperationType {
    pub const COUNT: usize = 5;

    pub const ALL: [OperationType; Self::COUNT] = [
        OperationType::Insert,
        OperationType::Delete,
        OperationType::Read,
        OperationType::Ping,
        OperationType::BlacklistRead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Delete => "delete",
            OperationType::Read => "read",
            OperationType::Ping => "ping",
            OperationType::BlacklistRead => "blacklistRead",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that can write records into the store.
#[async_trait]
pub trait Inserter: Send + Sync {
    async fn insert_records(&self, records: &[Record]) -> StoreResult<()>;
}

/// Something that can list expired records and delete them one at a time.
#[async_trait]
pub trait Pruner: Send + Sync {
    /// Return up to `limit` records of `shard` whose death date is before
    /// `death_date` (unix nanoseconds). A `limit` of zero means no limit.
    async fn get_records_to_delete(
        &self,
        shard: i32,
        limit: usize,
        death_date: i64,
    ) -> StoreResult<Vec<RecordToDelete>>;

    async fn delete_record(&self, shard: i32, death_date: i64, record_id: i64) -> StoreResult<()>;
}

/// Receives the end-to-end latency of each record once its batch has been
/// handed to the store, whether or not the insert succeeded.
pub trait TimeTracker: Send + Sync {
    fn track_time(&self, elapsed: Duration);
}

#[async_trait]
impl<T: Inserter + ?Sized> Inserter for Arc<T> {
    async fn insert_records(&self, records: &[Record]) -> StoreResult<()> {
        (**self).insert_records(records).await
    }
}

#[async_trait]
impl<T: Pruner + ?Sized> Pruner for Arc<T> {
    async fn get_records_to_delete(
        &self,
        shard: i32,
        limit: usize,
        death_date: i64,
    ) -> StoreResult<Vec<RecordToDelete>> {
        (**self)
            .get_records_to_delete(shard, limit, death_date)
            .await
    }

    async fn delete_record(&self, shard: i32, death_date: i64, record_id: i64) -> StoreResult<()> {
        (**self).delete_record(shard, death_date, record_id).await
    }
}

impl<T: TimeTracker + ?Sized> TimeTracker for Arc<T> {
    fn track_time(&self, elapsed: Duration) {
        (**self).track_time(elapsed)
    }
}
