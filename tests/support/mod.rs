use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::model::Record;

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("batcher=debug,pruner=debug,retry=debug,warn")
        .with_test_writer()
        .try_init();
}

pub fn unix_nanos(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

pub fn record(device: &str, death: SystemTime) -> Record {
    Record {
        device_id: device.to_string(),
        birth_date: unix_nanos(death - Duration::from_secs(3600)),
        death_date: unix_nanos(death),
        data: format!("{device} online").into_bytes(),
        ..Record::default()
    }
}
