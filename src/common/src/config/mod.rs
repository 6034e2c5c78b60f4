use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

pub const MIN_PARSE_WORKERS: usize = 1;
pub const DEFAULT_PARSE_WORKERS: usize = 1;
pub const MIN_INSERT_WORKERS: usize = 1;
pub const DEFAULT_INSERT_WORKERS: usize = 5;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1;
pub const MIN_MAX_BATCH_WAIT_TIME: Duration = Duration::from_millis(1);
pub const MIN_QUEUE_CAPACITY: usize = 5;

pub const MIN_DELETE_WORKERS: usize = 1;
pub const DEFAULT_DELETE_WORKERS: usize = 5;
pub const MIN_SET_CAPACITY: usize = 5;
pub const DEFAULT_SET_CAPACITY: usize = 1000;
pub const MIN_DELETE_WAIT_TIME: Duration = Duration::from_millis(1);
pub const DEFAULT_GET_LIMIT: usize = 10;
pub const MIN_GET_POLL_INTERVAL: Duration = Duration::from_millis(1);

pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;
pub const DEFAULT_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_ELAPSED_TIME: Duration = Duration::from_secs(15 * 60);

pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// A configuration value that was out of range and got replaced.
#[derive(Clone, Debug, PartialEq)]
pub struct Adjustment {
    pub field: &'static str,
    pub given: String,
    pub used: String,
}

impl Adjustment {
    fn new(field: &'static str, given: impl std::fmt::Debug, used: impl std::fmt::Debug) -> Self {
        Self {
            field,
            given: format!("{given:?}"),
            used: format!("{used:?}"),
        }
    }
}

/// Settings for the batch insert pipeline
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsertConfig {
    /// Number of tasks pulling records off the queue and forming batches
    pub parse_workers: usize,
    /// Maximum number of batch inserts in flight at once
    pub max_insert_workers: usize,
    /// Maximum records per batch; 0 flushes on time only
    pub max_batch_size: usize,
    /// Longest a batch waits for more records before it is flushed
    #[serde(with = "humantime_serde")]
    pub max_batch_wait_time: Duration,
    /// Number of accepted records that can wait for a batcher
    pub queue_capacity: usize,
}

impl Default for InsertConfig {
    fn default() -> Self {
        Self {
            parse_workers: DEFAULT_PARSE_WORKERS,
            max_insert_workers: DEFAULT_INSERT_WORKERS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_wait_time: MIN_MAX_BATCH_WAIT_TIME,
            queue_capacity: MIN_QUEUE_CAPACITY,
        }
    }
}

impl InsertConfig {
    /// Replace out-of-range values with their defaults, reporting each change.
    pub fn normalize(&mut self) -> Vec<Adjustment> {
        let mut adjustments = Vec::new();
        if self.parse_workers < MIN_PARSE_WORKERS {
            adjustments.push(Adjustment::new(
                "insert.parse_workers",
                self.parse_workers,
                DEFAULT_PARSE_WORKERS,
            ));
            self.parse_workers = DEFAULT_PARSE_WORKERS;
        }
        if self.max_insert_workers < MIN_INSERT_WORKERS {
            adjustments.push(Adjustment::new(
                "insert.max_insert_workers",
                self.max_insert_workers,
                DEFAULT_INSERT_WORKERS,
            ));
            self.max_insert_workers = DEFAULT_INSERT_WORKERS;
        }
        if self.max_batch_wait_time < MIN_MAX_BATCH_WAIT_TIME {
            adjustments.push(Adjustment::new(
                "insert.max_batch_wait_time",
                self.max_batch_wait_time,
                MIN_MAX_BATCH_WAIT_TIME,
            ));
            self.max_batch_wait_time = MIN_MAX_BATCH_WAIT_TIME;
        }
        if self.queue_capacity < MIN_QUEUE_CAPACITY {
            adjustments.push(Adjustment::new(
                "insert.queue_capacity",
                self.queue_capacity,
                MIN_QUEUE_CAPACITY,
            ));
            self.queue_capacity = MIN_QUEUE_CAPACITY;
        }
        adjustments
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }
}

/// Settings for the batch delete pipeline
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteConfig {
    /// Shard whose expired records this deleter owns
    pub shard: i32,
    /// Maximum number of deletes in flight at once
    pub max_workers: usize,
    /// Maximum number of distinct identifiers waiting to be deleted
    pub set_capacity: usize,
    /// Pause between two delete dispatches
    #[serde(with = "humantime_serde")]
    pub delete_wait_time: Duration,
    /// Maximum identifiers fetched per scan; 0 fetches all
    pub get_limit: usize,
    /// Interval between scans for expired records
    #[serde(with = "humantime_serde")]
    pub get_poll_interval: Duration,
}

impl Default for DeleteConfig {
    fn default() -> Self {
        Self {
            shard: 0,
            max_workers: DEFAULT_DELETE_WORKERS,
            set_capacity: DEFAULT_SET_CAPACITY,
            delete_wait_time: MIN_DELETE_WAIT_TIME,
            get_limit: DEFAULT_GET_LIMIT,
            get_poll_interval: MIN_GET_POLL_INTERVAL,
        }
    }
}

impl DeleteConfig {
    /// Replace out-of-range values with their defaults, reporting each change.
    pub fn normalize(&mut self) -> Vec<Adjustment> {
        let mut adjustments = Vec::new();
        if self.max_workers < MIN_DELETE_WORKERS {
            adjustments.push(Adjustment::new(
                "delete.max_workers",
                self.max_workers,
                DEFAULT_DELETE_WORKERS,
            ));
            self.max_workers = DEFAULT_DELETE_WORKERS;
        }
        if self.set_capacity < MIN_SET_CAPACITY {
            adjustments.push(Adjustment::new(
                "delete.set_capacity",
                self.set_capacity,
                DEFAULT_SET_CAPACITY,
            ));
            self.set_capacity = DEFAULT_SET_CAPACITY;
        }
        if self.delete_wait_time < MIN_DELETE_WAIT_TIME {
            adjustments.push(Adjustment::new(
                "delete.delete_wait_time",
                self.delete_wait_time,
                MIN_DELETE_WAIT_TIME,
            ));
            self.delete_wait_time = MIN_DELETE_WAIT_TIME;
        }
        if self.get_poll_interval < MIN_GET_POLL_INTERVAL {
            adjustments.push(Adjustment::new(
                "delete.get_poll_interval",
                self.get_poll_interval,
                MIN_GET_POLL_INTERVAL,
            ));
            self.get_poll_interval = MIN_GET_POLL_INTERVAL;
        }
        adjustments
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }
}

/// Exponential backoff settings for retried inserts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Wrap the store's inserter with retries
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,
    /// Jitter applied to every interval, as a fraction of it
    pub randomization_factor: f64,
    /// Growth factor between consecutive intervals
    pub multiplier: f64,
    /// Cap on any single interval
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    /// Give up once this much time has passed; zero retries forever
    #[serde(with = "humantime_serde")]
    pub max_elapsed_time: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
            multiplier: DEFAULT_MULTIPLIER,
            max_interval: DEFAULT_MAX_INTERVAL,
            max_elapsed_time: DEFAULT_MAX_ELAPSED_TIME,
        }
    }
}

impl RetryConfig {
    /// Replace out-of-range values with their defaults, reporting each change.
    pub fn normalize(&mut self) -> Vec<Adjustment> {
        let mut adjustments = Vec::new();
        if !self.randomization_factor.is_finite() || self.randomization_factor < 0.0 {
            adjustments.push(Adjustment::new(
                "retry.randomization_factor",
                self.randomization_factor,
                DEFAULT_RANDOMIZATION_FACTOR,
            ));
            self.randomization_factor = DEFAULT_RANDOMIZATION_FACTOR;
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            adjustments.push(Adjustment::new(
                "retry.multiplier",
                self.multiplier,
                DEFAULT_MULTIPLIER,
            ));
            self.multiplier = DEFAULT_MULTIPLIER;
        }
        adjustments
    }
}

/// Settings for the bundled in-memory store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of shards records are spread across
    pub shards: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { shards: 1 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// How often the service logs a metrics summary
    #[serde(with = "humantime_serde")]
    pub metrics_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            metrics_interval: DEFAULT_METRICS_INTERVAL,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub insert: InsertConfig,
    pub delete: DeleteConfig,
    pub retry: RetryConfig,
    pub store: StoreConfig,
    pub service: ServiceConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file("eventbatch.toml"))
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(path))
    }

    fn figment(file: figment::providers::Data<Toml>) -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(file)
            .merge(Env::prefixed("EVENTBATCH__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    /// Replace every out-of-range value with its default.
    pub fn normalize(&mut self) -> Vec<Adjustment> {
        let mut adjustments = self.insert.normalize();
        adjustments.extend(self.delete.normalize());
        adjustments.extend(self.retry.normalize());
        if self.store.shards < 1 {
            adjustments.push(Adjustment::new("store.shards", self.store.shards, 1));
            self.store.shards = 1;
        }
        if self.service.metrics_interval.is_zero() {
            adjustments.push(Adjustment::new(
                "service.metrics_interval",
                self.service.metrics_interval,
                DEFAULT_METRICS_INTERVAL,
            ));
            self.service.metrics_interval = DEFAULT_METRICS_INTERVAL;
        }
        adjustments
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_configuration_is_valid() {
        let mut config = Configuration::default();
        assert!(config.normalize().is_empty());

        assert_eq!(config.insert.parse_workers, 1);
        assert_eq!(config.insert.max_insert_workers, 5);
        assert_eq!(config.insert.max_batch_size, 1);
        assert_eq!(config.insert.max_batch_wait_time, Duration::from_millis(1));
        assert_eq!(config.insert.queue_capacity, 5);

        assert_eq!(config.delete.max_workers, 5);
        assert_eq!(config.delete.set_capacity, 1000);
        assert_eq!(config.delete.delete_wait_time, Duration::from_millis(1));
        assert_eq!(config.delete.get_limit, 10);
        assert_eq!(config.delete.get_poll_interval, Duration::from_millis(1));
    }

    #[test]
    fn test_insert_config_defaults_replace_invalid_values() {
        let mut config = InsertConfig {
            parse_workers: 0,
            max_insert_workers: 0,
            max_batch_size: 0,
            max_batch_wait_time: Duration::ZERO,
            queue_capacity: 2,
        };

        let adjustments = config.normalize();

        assert_eq!(adjustments.len(), 4);
        assert_eq!(config.parse_workers, DEFAULT_PARSE_WORKERS);
        assert_eq!(config.max_insert_workers, DEFAULT_INSERT_WORKERS);
        // zero is a valid batch size: time-only flushing
        assert_eq!(config.max_batch_size, 0);
        assert_eq!(config.max_batch_wait_time, MIN_MAX_BATCH_WAIT_TIME);
        assert_eq!(config.queue_capacity, MIN_QUEUE_CAPACITY);
    }

    #[test]
    fn test_insert_config_keeps_valid_values() {
        let config = InsertConfig {
            parse_workers: 50,
            max_insert_workers: 5000,
            max_batch_size: 100,
            max_batch_wait_time: Duration::from_secs(5 * 3600),
            queue_capacity: 1000,
        };
        assert_eq!(config.clone().normalized(), config);
    }

    #[test]
    fn test_delete_config_defaults_replace_invalid_values() {
        let config = DeleteConfig {
            shard: 3,
            max_workers: 0,
            set_capacity: 1,
            delete_wait_time: Duration::ZERO,
            get_limit: 0,
            get_poll_interval: Duration::from_micros(10),
        }
        .normalized();

        assert_eq!(config.shard, 3);
        assert_eq!(config.max_workers, DEFAULT_DELETE_WORKERS);
        assert_eq!(config.set_capacity, DEFAULT_SET_CAPACITY);
        assert_eq!(config.delete_wait_time, MIN_DELETE_WAIT_TIME);
        assert_eq!(config.get_limit, 0);
        assert_eq!(config.get_poll_interval, MIN_GET_POLL_INTERVAL);
    }

    #[test]
    fn test_retry_config_defaults_replace_invalid_values() {
        let mut config = RetryConfig {
            randomization_factor: -1.0,
            multiplier: 0.0,
            ..RetryConfig::default()
        };

        let adjustments = config.normalize();
        let fields: Vec<_> = adjustments.iter().map(|a| a.field).collect();

        assert_eq!(fields, vec!["retry.randomization_factor", "retry.multiplier"]);
        assert_eq!(config.randomization_factor, DEFAULT_RANDOMIZATION_FACTOR);
        assert_eq!(config.multiplier, DEFAULT_MULTIPLIER);
    }

    #[test]
    fn test_configless_operation() {
        Jail::expect_with(|_jail| {
            let config = Configuration::load().expect("defaults should load");
            assert_eq!(config, Configuration::default());
            Ok(())
        });
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "eventbatch.toml",
                r#"
                [insert]
                parse_workers = 4
                max_batch_size = 100
                max_batch_wait_time = "250ms"

                [delete]
                shard = 2
                get_poll_interval = "5s"

                [retry]
                enabled = false
                "#,
            )?;

            let config = Configuration::load().expect("file should load");
            assert_eq!(config.insert.parse_workers, 4);
            assert_eq!(config.insert.max_batch_size, 100);
            assert_eq!(config.insert.max_batch_wait_time, Duration::from_millis(250));
            assert_eq!(config.insert.queue_capacity, MIN_QUEUE_CAPACITY);
            assert_eq!(config.delete.shard, 2);
            assert_eq!(config.delete.get_poll_interval, Duration::from_secs(5));
            assert!(!config.retry.enabled);
            Ok(())
        });
    }

    #[test]
    fn test_env_var_override() {
        Jail::expect_with(|jail| {
            jail.set_env("EVENTBATCH__INSERT__MAX_INSERT_WORKERS", "12");
            jail.set_env("EVENTBATCH__DELETE__DELETE_WAIT_TIME", "20ms");

            let config = Configuration::load().expect("env should load");
            assert_eq!(config.insert.max_insert_workers, 12);
            assert_eq!(config.delete.delete_wait_time, Duration::from_millis(20));
            Ok(())
        });
    }

    #[test]
    fn test_load_from_path() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "[store]\nshards = 8\n")?;

            let config = Configuration::load_from_path(Path::new("custom.toml"))
                .expect("custom file should load");
            assert_eq!(config.store.shards, 8);
            Ok(())
        });
    }
}
