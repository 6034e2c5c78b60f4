//! Retrying store decorator
//!
//! [`RetryInsertService`] wraps any [`Inserter`] and retries failed inserts
//! with jittered exponential backoff until one succeeds or the elapsed-time
//! budget runs out.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use common::clock::{Clock, system_clock};
use common::config::{
    DEFAULT_INITIAL_INTERVAL, DEFAULT_MAX_ELAPSED_TIME, DEFAULT_MAX_INTERVAL, DEFAULT_MULTIPLIER,
    DEFAULT_RANDOMIZATION_FACTOR, RetryConfig,
};
use common::db::{Inserter, OperationType};
use common::error::StoreResult;
use common::metrics::RetryMetrics;
use common::model::Record;
use rand::Rng;

/// How long to wait between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_interval: Duration,
    /// Each interval is drawn from `interval * (1 ± randomization_factor)`
    pub randomization_factor: f64,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Stop retrying once this much time has passed; zero never stops
    pub max_elapsed_time: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
            multiplier: DEFAULT_MULTIPLIER,
            max_interval: DEFAULT_MAX_INTERVAL,
            max_elapsed_time: DEFAULT_MAX_ELAPSED_TIME,
        }
    }
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_interval: config.initial_interval,
            randomization_factor: config.randomization_factor,
            multiplier: config.multiplier,
            max_interval: config.max_interval,
            max_elapsed_time: config.max_elapsed_time,
        }
        .normalized()
    }
}

impl BackoffPolicy {
    /// Replace fields that cannot describe a backoff with their defaults.
    pub fn normalized(mut self) -> Self {
        if !self.randomization_factor.is_finite() || self.randomization_factor < 0.0 {
            self.randomization_factor = DEFAULT_RANDOMIZATION_FACTOR;
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            self.multiplier = DEFAULT_MULTIPLIER;
        }
        self
    }

    /// Backoff state for one call that began at `started_at`.
    pub fn start(&self, started_at: SystemTime) -> ExponentialBackoff {
        ExponentialBackoff {
            policy: *self,
            current: self.initial_interval,
            started_at,
        }
    }
}

/// Per-call backoff state
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    current: Duration,
    started_at: SystemTime,
}

impl ExponentialBackoff {
    /// The next interval to wait, or `None` once the elapsed-time budget is
    /// spent.
    pub fn next_backoff(&mut self, now: SystemTime) -> Option<Duration> {
        self.next_backoff_with(now, &mut rand::thread_rng())
    }

    pub fn next_backoff_with<R: Rng + ?Sized>(
        &mut self,
        now: SystemTime,
        rng: &mut R,
    ) -> Option<Duration> {
        let elapsed = now.duration_since(self.started_at).unwrap_or_default();
        let budget = self.policy.max_elapsed_time;
        if !budget.is_zero() && elapsed > budget {
            return None;
        }

        let next = randomize(self.current, self.policy.randomization_factor, rng);
        let max = self.policy.max_interval;
        let grown = self.current.as_secs_f64() * self.policy.multiplier;
        self.current = Duration::try_from_secs_f64(grown).map_or(max, |grown| grown.min(max));
        Some(next)
    }
}

fn randomize<R: Rng + ?Sized>(interval: Duration, factor: f64, rng: &mut R) -> Duration {
    if factor == 0.0 || interval.is_zero() {
        return interval;
    }
    let base = interval.as_secs_f64();
    let delta = factor * base;
    let low = (base - delta).max(0.0);
    let high = base + delta;
    Duration::try_from_secs_f64(rng.gen_range(low..=high)).unwrap_or(interval)
}

/// Retries failed inserts of the wrapped [`Inserter`].
pub struct RetryInsertService<I> {
    inner: I,
    policy: BackoffPolicy,
    metrics: RetryMetrics,
    clock: Arc<dyn Clock>,
}

impl<I: Inserter> RetryInsertService<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            policy: BackoffPolicy::default(),
            metrics: RetryMetrics::new(),
            clock: system_clock(),
        }
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy.normalized();
        self
    }

    pub fn with_metrics(mut self, metrics: RetryMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> &RetryMetrics {
        &self.metrics
    }
}

#[async_trait]
impl<I: Inserter> Inserter for RetryInsertService<I> {
    async fn insert_records(&self, records: &[Record]) -> StoreResult<()> {
        let mut backoff = self.policy.start(self.clock.now());
        let mut attempt = 1u32;

        let result = loop {
            let err = match self.inner.insert_records(records).await {
                Ok(()) => break Ok(()),
                Err(e) => e,
            };

            let Some(delay) = backoff.next_backoff(self.clock.now()) else {
                tracing::error!(
                    op = %OperationType::Insert,
                    attempts = attempt,
                    records = records.len(),
                    error = %err,
                    "giving up on query"
                );
                break Err(err);
            };

            self.metrics.record_retry(OperationType::Insert);
            tracing::warn!(
                op = %OperationType::Insert,
                attempt,
                delay = ?delay,
                error = %err,
                "query failed, retrying"
            );
            self.clock.sleep(delay).await;
            attempt += 1;
        };

        self.metrics.record_query_end(OperationType::Insert);
        result
    }
}
