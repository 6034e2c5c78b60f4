pub mod clock;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod metrics;
pub mod model;
pub mod store;
pub mod task;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use db::{Inserter, OperationType, Pruner, TimeTracker};
pub use dedup::DedupSet;
pub use error::{ConfigError, InsertError, StoreError, StoreResult};
pub use task::TaskGroup;
