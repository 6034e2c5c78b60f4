//! Storage backends bundled with the pipelines.

mod memory;

pub use memory::{MemoryStore, StoredRecord};
