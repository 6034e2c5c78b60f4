use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use batcher::BatchInserter;
use common::config::Configuration;
use common::db::Inserter;
use common::metrics::{DeleteMetrics, InsertMetrics, MetricsSummary, RetryMetrics};
use common::model::{Record, RecordWithTime};
use common::store::MemoryStore;
use pruner::BatchDeleter;
use retry::{BackoffPolicy, RetryInsertService};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::latency::LatencyTracker;

/// Both pipelines wired to an in-memory store.
pub struct Service {
    config: Configuration,
    store: Arc<MemoryStore>,
    inserter: BatchInserter,
    deleter: BatchDeleter,
    latency: Arc<LatencyTracker>,
    insert_metrics: InsertMetrics,
    delete_metrics: DeleteMetrics,
    retry_metrics: RetryMetrics,
}

impl Service {
    pub fn new(config: Configuration) -> Result<Self> {
        let mut config = config;
        for adjustment in config.normalize() {
            tracing::warn!(
                field = adjustment.field,
                given = %adjustment.given,
                used = %adjustment.used,
                "configuration value out of range, using default"
            );
        }

        let store = Arc::new(MemoryStore::new(config.store.shards));
        let insert_metrics = InsertMetrics::new();
        let delete_metrics = DeleteMetrics::new();
        let retry_metrics = RetryMetrics::new();
        let latency = Arc::new(LatencyTracker::new());

        let sink: Arc<dyn Inserter> = if config.retry.enabled {
            Arc::new(
                RetryInsertService::new(store.clone())
                    .with_backoff(BackoffPolicy::from(&config.retry))
                    .with_metrics(retry_metrics.clone()),
            )
        } else {
            store.clone()
        };

        let inserter = BatchInserter::builder(config.insert.clone())
            .inserter(sink)
            .time_tracker(latency.clone())
            .metrics(insert_metrics.clone())
            .build()
            .context("Failed to build batch inserter")?;

        let deleter = BatchDeleter::builder(config.delete.clone())
            .pruner(store.clone())
            .metrics(delete_metrics.clone())
            .build()
            .context("Failed to build batch deleter")?;

        Ok(Self {
            config,
            store,
            inserter,
            deleter,
            latency,
            insert_metrics,
            delete_metrics,
            retry_metrics,
        })
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary::collect(
            &self.insert_metrics,
            &self.delete_metrics,
            &self.retry_metrics,
        )
    }

    /// Submit newline-delimited JSON records from `input` until it ends or
    /// `shutdown` resolves, then drain both pipelines.
    pub async fn run<R, S>(&self, input: R, shutdown: S) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        S: Future<Output = ()>,
    {
        self.inserter.start();
        self.deleter.start();

        let mut lines = input.lines();
        let mut ticker = tokio::time::interval(self.config.service.metrics_interval);
        ticker.tick().await;
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break Ok(());
                }
                _ = ticker.tick() => {
                    self.summary().log();
                    self.latency.log();
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.submit(&line).await,
                    Ok(None) => {
                        tracing::info!("Input closed");
                        break Ok(());
                    }
                    Err(e) => break Err(e).context("Failed to read input"),
                },
            }
        };

        self.stop().await;
        result
    }

    async fn submit(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let record: Record = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unparsable record");
                return;
            }
        };

        let device_id = record.device_id.clone();
        if let Err(e) = self
            .inserter
            .insert(RecordWithTime::new(record, SystemTime::now()))
            .await
        {
            tracing::warn!(device_id = %device_id, error = %e, "Record rejected");
        }
    }

    /// Stop both pipelines and wait for in-flight work.
    pub async fn stop(&self) {
        tokio::join!(self.inserter.stop(), self.deleter.stop());
        self.summary().log();
        self.latency.log();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntest::timeout;
    use std::time::Duration;
    use tokio::io::BufReader;

    fn far_future() -> i64 {
        i64::MAX
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn test_run_inserts_valid_lines_until_eof() {
        let input = format!(
            "{}\n\n{}\nnot json\n{}\n{}\n",
            r#"{"deviceid":"a","deathdate":DD,"data":[1,2,3]}"#,
            r#"{"deviceid":"b","deathdate":DD,"data":[4]}"#,
            r#"{"deviceid":"c","deathdate":DD,"data":[]}"#,
            r#"{"recordtype":"State","deviceid":"d","deathdate":DD,"data":[5]}"#,
        )
        .replace("DD", &far_future().to_string());

        let service = Service::new(Configuration::default()).unwrap();
        service
            .run(BufReader::new(input.as_bytes()), std::future::pending())
            .await
            .unwrap();

        let mut devices: Vec<_> = service
            .store()
            .records()
            .await
            .into_iter()
            .map(|r| r.record.device_id)
            .collect();
        devices.sort();
        assert_eq!(devices, vec!["a", "b", "d"]);

        let summary = service.summary();
        assert_eq!(summary.records_inserted, 3);
        assert_eq!(summary.inserting_queue_depth, 0);
        assert_eq!(summary.insert_query_ends, summary.batches_dispatched);
        assert_eq!(service.latency.count(), 3);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn test_run_stops_on_shutdown() {
        let (_writer, reader) = tokio::io::duplex(64);
        let service = Service::new(Configuration::default()).unwrap();

        service
            .run(
                BufReader::new(reader),
                tokio::time::sleep(Duration::from_millis(20)),
            )
            .await
            .unwrap();

        assert!(service.store().is_empty().await);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn test_retry_layer_can_be_disabled() {
        let mut config = Configuration::default();
        config.retry.enabled = false;
        let service = Service::new(config).unwrap();
        service.store().fail_next_inserts(1);

        let input = r#"{"deviceid":"a","deathdate":9223372036854775807,"data":[1]}"#;
        service
            .run(BufReader::new(input.as_bytes()), std::future::pending())
            .await
            .unwrap();

        let summary = service.summary();
        assert_eq!(summary.dropped_records, 1);
        assert_eq!(summary.insert_query_ends, 0);
        assert!(service.store().is_empty().await);
    }
}
