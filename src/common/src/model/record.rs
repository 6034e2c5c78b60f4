use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Kind of device event carried by a [`Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EventType {
    #[default]
    Default,
    /// Online and offline events
    State,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Default => "Default",
            EventType::State => "State",
        }
    }

    /// Parse an event type by name. Unknown names map to [`EventType::Default`].
    pub fn parse(name: &str) -> Self {
        name.parse().unwrap_or_default()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Default" => Ok(EventType::Default),
            "State" => Ok(EventType::State),
            other => Err(UnknownEventType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

/// A single device event as it is written to the store.
///
/// `data` holds the marshaled (and possibly encrypted) event. When it is
/// encrypted, `nonce`, `alg` and `kid` describe how to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Record {
    #[serde(rename = "recordtype")]
    pub record_type: EventType,
    #[serde(rename = "deviceid")]
    pub device_id: String,
    /// Unix nanoseconds
    #[serde(rename = "birthdate")]
    pub birth_date: i64,
    /// Unix nanoseconds after which the record may be pruned
    #[serde(rename = "deathdate")]
    pub death_date: i64,
    pub data: Vec<u8>,
    pub nonce: Vec<u8>,
    pub alg: String,
    pub kid: String,
    #[serde(rename = "rowid")]
    pub row_id: String,
}

impl Record {
    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }
}

/// A record paired with the moment it entered the pipeline, used for
/// end-to-end latency tracking.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordWithTime {
    pub record: Record,
    pub submitted_at: Option<SystemTime>,
}

impl RecordWithTime {
    pub fn new(record: Record, submitted_at: SystemTime) -> Self {
        Self {
            record,
            submitted_at: Some(submitted_at),
        }
    }

    pub fn untimed(record: Record) -> Self {
        Self {
            record,
            submitted_at: None,
        }
    }
}

impl From<Record> for RecordWithTime {
    fn from(record: Record) -> Self {
        Self::untimed(record)
    }
}

/// Identifies an expired record that the pruner should delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordToDelete {
    #[serde(rename = "deathdate")]
    pub death_date: i64,
    #[serde(rename = "recordid")]
    pub record_id: i64,
}

impl RecordToDelete {
    pub fn new(death_date: i64, record_id: i64) -> Self {
        Self {
            death_date,
            record_id,
        }
    }
}
