//! Batch delete pipeline
//!
//! A scanner task polls the store for expired records of one shard and
//! collects their identifiers in a bounded [`DedupSet`], so a record that
//! shows up in several scans before it is deleted is only deleted once. A
//! dispatcher task drains the set one identifier at a time, paced by
//! `delete_wait_time` and limited to `max_workers` deletes in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::clock::{Clock, system_clock};
use common::config::DeleteConfig;
use common::db::Pruner;
use common::dedup::DedupSet;
use common::error::ConfigError;
use common::metrics::DeleteMetrics;
use common::model::RecordToDelete;
use common::task::TaskGroup;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

/// Builder for [`BatchDeleter`]
pub struct BatchDeleterBuilder {
    config: DeleteConfig,
    pruner: Option<Arc<dyn Pruner>>,
    metrics: DeleteMetrics,
    clock: Arc<dyn Clock>,
}

impl BatchDeleterBuilder {
    /// Store that lists and deletes expired records. Required.
    pub fn pruner(mut self, pruner: Arc<dyn Pruner>) -> Self {
        self.pruner = Some(pruner);
        self
    }

    pub fn metrics(mut self, metrics: DeleteMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<BatchDeleter, ConfigError> {
        let pruner = self.pruner.ok_or(ConfigError::MissingCollaborator("pruner"))?;
        let config = self.config.normalized();
        let (stop, _) = watch::channel(false);

        Ok(BatchDeleter {
            shared: Arc::new(Shared {
                pending: DedupSet::new(config.set_capacity),
                permits: Arc::new(Semaphore::new(config.max_workers)),
                config,
                pruner,
                metrics: self.metrics,
                clock: self.clock,
            }),
            stop,
            started: AtomicBool::new(false),
            tasks: TaskGroup::new("batch deleter"),
        })
    }
}

struct Shared {
    config: DeleteConfig,
    pruner: Arc<dyn Pruner>,
    metrics: DeleteMetrics,
    clock: Arc<dyn Clock>,
    pending: DedupSet<RecordToDelete>,
    permits: Arc<Semaphore>,
}

/// Deletes expired records of one shard in the background.
pub struct BatchDeleter {
    shared: Arc<Shared>,
    stop: watch::Sender<bool>,
    started: AtomicBool,
    tasks: TaskGroup,
}

impl BatchDeleter {
    pub fn builder(config: DeleteConfig) -> BatchDeleterBuilder {
        BatchDeleterBuilder {
            config,
            pruner: None,
            metrics: DeleteMetrics::new(),
            clock: system_clock(),
        }
    }

    /// Effective configuration after out-of-range values were replaced.
    pub fn config(&self) -> &DeleteConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &DeleteMetrics {
        &self.shared.metrics
    }

    /// Number of identifiers waiting to be deleted.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }

    /// Spawn the scanner and dispatcher. Calling it again, or after
    /// [`stop`](Self::stop), has no effect.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if *self.stop.borrow() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.tasks
            .spawn(run_scanner(self.shared.clone(), self.stop.subscribe()));
        self.tasks
            .spawn(run_dispatcher(self.shared.clone(), self.stop.subscribe()));

        tracing::info!(
            shard = self.shared.config.shard,
            max_workers = self.shared.config.max_workers,
            set_capacity = self.shared.config.set_capacity,
            get_limit = self.shared.config.get_limit,
            get_poll_interval = ?self.shared.config.get_poll_interval,
            delete_wait_time = ?self.shared.config.delete_wait_time,
            "batch deleter started"
        );
    }

    /// Stop scanning and dispatching, then wait for every delete in flight.
    ///
    /// Identifiers still pending are left behind; if their records are still
    /// expired they are picked up again by the next scan after a restart.
    /// Dropping the returned future stops the wait, not the drain.
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        self.tasks.drain().await;

        tracing::info!(
            shard = self.shared.config.shard,
            pending = self.shared.pending.len(),
            "batch deleter stopped"
        );
    }
}

/// Resolve once `stop` has been set.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        let is_stopped = *stop.borrow_and_update();
        if is_stopped || stop.changed().await.is_err() {
            return;
        }
    }
}

async fn run_scanner(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = stopped(&mut stop) => break,
            _ = shared.clock.sleep(shared.config.get_poll_interval) => {}
        }
        shared.scan().await;
    }
    tracing::debug!(shard = shared.config.shard, "scanner exited");
}

async fn run_dispatcher(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut deletes = JoinSet::new();

    loop {
        let target = tokio::select! {
            _ = stopped(&mut stop) => break,
            target = shared.pending.pop() => target,
        };
        shared.metrics.record_dequeued();

        // Once popped, an identifier is always dispatched, even during stop.
        let permit = match shared.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::error!(record_id = target.record_id, error = %e, "no delete permit");
                break;
            }
        };

        let task_shared = shared.clone();
        deletes.spawn(async move {
            let _permit = permit;
            task_shared.delete(target).await;
        });
        while let Some(result) = deletes.try_join_next() {
            if let Err(e) = result {
                tracing::error!(error = %e, "delete task failed");
            }
        }

        tokio::select! {
            _ = stopped(&mut stop) => break,
            _ = shared.clock.sleep(shared.config.delete_wait_time) => {}
        }
    }

    while let Some(result) = deletes.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "delete task failed");
        }
    }
    tracing::debug!(shard = shared.config.shard, "dispatcher exited");
}

impl Shared {
    async fn scan(&self) {
        self.metrics.record_scan();
        let cutoff = self.clock.unix_nanos();

        let expired = match self
            .pruner
            .get_records_to_delete(self.config.shard, self.config.get_limit, cutoff)
            .await
        {
            Ok(expired) => expired,
            Err(e) => {
                self.metrics.record_scan_failure();
                tracing::error!(shard = self.config.shard, error = %e, "failed to list expired records");
                return;
            }
        };

        let found = expired.len();
        let mut added = 0;
        for target in expired {
            if self.pending.add(target) {
                self.metrics.record_enqueued();
                added += 1;
            }
        }

        if found > 0 {
            tracing::debug!(shard = self.config.shard, found, added, "scanned for expired records");
        }
    }

    async fn delete(&self, target: RecordToDelete) {
        match self
            .pruner
            .delete_record(self.config.shard, target.death_date, target.record_id)
            .await
        {
            Ok(()) => {
                self.metrics.record_delete_success();
                tracing::debug!(
                    shard = self.config.shard,
                    record_id = target.record_id,
                    "deleted expired record"
                );
            }
            Err(e) => {
                self.metrics.record_delete_failure();
                tracing::error!(
                    shard = self.config.shard,
                    record_id = target.record_id,
                    death_date = target.death_date,
                    error = %e,
                    "failed to delete record"
                );
            }
        }
    }
}
