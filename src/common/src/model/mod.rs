mod record;

pub use record::{EventType, Record, RecordToDelete, RecordWithTime, UnknownEventType};
