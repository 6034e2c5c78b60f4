//! Batch insert pipeline
//!
//! Records accepted by [`BatchInserter::insert`] wait in a bounded queue.
//! A fixed number of batcher tasks pull from that queue, each growing one
//! batch at a time until its window elapses or it is full, and hand the batch
//! to an insert task. Insert tasks are limited by a semaphore, so a slow store
//! pushes back first on the batchers and then on callers of `insert`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use common::clock::{Clock, system_clock};
use common::config::InsertConfig;
use common::db::{Inserter, TimeTracker};
use common::error::{ConfigError, InsertError};
use common::metrics::InsertMetrics;
use common::model::{Record, RecordWithTime};
use common::task::TaskGroup;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<RecordWithTime>>>;

/// Builder for [`BatchInserter`]
pub struct BatchInserterBuilder {
    config: InsertConfig,
    inserter: Option<Arc<dyn Inserter>>,
    tracker: Option<Arc<dyn TimeTracker>>,
    metrics: InsertMetrics,
    clock: Arc<dyn Clock>,
}

impl BatchInserterBuilder {
    /// Store that receives every batch. Required.
    pub fn inserter(mut self, inserter: Arc<dyn Inserter>) -> Self {
        self.inserter = Some(inserter);
        self
    }

    /// Report per-record latency once each batch insert concludes.
    ///
    /// With a tracker set, every record must carry its submission time.
    pub fn time_tracker(mut self, tracker: Arc<dyn TimeTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn metrics(mut self, metrics: InsertMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<BatchInserter, ConfigError> {
        let inserter = self
            .inserter
            .ok_or(ConfigError::MissingCollaborator("inserter"))?;
        let config = self.config.normalized();

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let permits = Arc::new(Semaphore::new(config.max_insert_workers));

        Ok(BatchInserter {
            shared: Arc::new(Shared {
                config,
                inserter,
                tracker: self.tracker,
                metrics: self.metrics,
                clock: self.clock,
                permits,
            }),
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            batchers: TaskGroup::new("batch inserter"),
        })
    }
}

/// State shared by the batcher and insert tasks
struct Shared {
    config: InsertConfig,
    inserter: Arc<dyn Inserter>,
    tracker: Option<Arc<dyn TimeTracker>>,
    metrics: InsertMetrics,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
}

/// Groups individually submitted records into batch inserts.
pub struct BatchInserter {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::Sender<RecordWithTime>>>,
    receiver: Mutex<Option<mpsc::Receiver<RecordWithTime>>>,
    batchers: TaskGroup,
}

impl BatchInserter {
    pub fn builder(config: InsertConfig) -> BatchInserterBuilder {
        BatchInserterBuilder {
            config,
            inserter: None,
            tracker: None,
            metrics: InsertMetrics::new(),
            clock: system_clock(),
        }
    }

    /// Effective configuration after out-of-range values were replaced.
    pub fn config(&self) -> &InsertConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &InsertMetrics {
        &self.shared.metrics
    }

    /// Spawn the batcher tasks. Calling it again has no effect.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let Some(receiver) = lock(&self.receiver).take() else {
            return;
        };
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(receiver));

        for worker in 0..self.shared.config.parse_workers {
            self.batchers
                .spawn(run_batcher(worker, self.shared.clone(), receiver.clone()));
        }

        tracing::info!(
            parse_workers = self.shared.config.parse_workers,
            max_insert_workers = self.shared.config.max_insert_workers,
            max_batch_size = self.shared.config.max_batch_size,
            max_batch_wait_time = ?self.shared.config.max_batch_wait_time,
            "batch inserter started"
        );
    }

    /// Queue a record for insertion.
    ///
    /// Waits while the queue is full. Returns once the record is queued, not
    /// once it is stored.
    pub async fn insert(&self, record: RecordWithTime) -> Result<(), InsertError> {
        if !record.record.has_data() {
            return Err(InsertError::BadData);
        }
        if self.shared.tracker.is_some() && record.submitted_at.is_none() {
            return Err(InsertError::BadBeginning);
        }

        let sender = lock(&self.sender).clone().ok_or(InsertError::Stopped)?;

        let slot = sender.reserve().await.map_err(|_| InsertError::Stopped)?;
        self.shared.metrics.record_enqueued();
        slot.send(record);
        Ok(())
    }

    /// Close the queue and wait until every accepted record has been handed
    /// to the store and every insert task has finished.
    ///
    /// Dropping the returned future stops the wait, not the drain.
    pub async fn stop(&self) {
        // Records queued before start still need a batcher to drain them.
        self.start();
        drop(lock(&self.sender).take());

        self.batchers.drain().await;
        tracing::info!("batch inserter stopped");
    }
}

async fn run_batcher(worker: usize, shared: Arc<Shared>, receiver: SharedReceiver) {
    let max_size = shared.config.max_batch_size;
    let is_full = |batch: &Vec<RecordWithTime>| max_size > 0 && batch.len() >= max_size;
    let mut inserts = JoinSet::new();

    loop {
        let Some(first) = next_record(&receiver).await else {
            break;
        };
        shared.metrics.record_dequeued();

        let mut batch = vec![first];
        let mut closed = false;
        let mut window = shared.clock.sleep(shared.config.max_batch_wait_time);

        while !is_full(&batch) {
            tokio::select! {
                _ = &mut window => break,
                next = next_record(&receiver) => match next {
                    Some(record) => {
                        shared.metrics.record_dequeued();
                        batch.push(record);
                    }
                    None => {
                        closed = true;
                        break;
                    }
                },
            }
        }

        dispatch(&shared, worker, batch, &mut inserts).await;
        while let Some(result) = inserts.try_join_next() {
            if let Err(e) = result {
                tracing::error!(worker, error = %e, "insert task failed");
            }
        }

        if closed {
            break;
        }
    }

    while let Some(result) = inserts.join_next().await {
        if let Err(e) = result {
            tracing::error!(worker, error = %e, "insert task failed");
        }
    }
    tracing::debug!(worker, "batcher exited");
}

async fn next_record(receiver: &SharedReceiver) -> Option<RecordWithTime> {
    receiver.lock().await.recv().await
}

async fn dispatch(
    shared: &Arc<Shared>,
    worker: usize,
    batch: Vec<RecordWithTime>,
    inserts: &mut JoinSet<()>,
) {
    let permit = match shared.permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => {
            shared.metrics.record_dropped(batch.len());
            tracing::error!(worker, records = batch.len(), error = %e, "no insert permit, batch dropped");
            return;
        }
    };

    shared.metrics.record_batch_dispatched();
    let shared = shared.clone();
    inserts.spawn(async move {
        let _permit = permit;
        shared.insert_batch(worker, batch).await;
    });
}

impl Shared {
    async fn insert_batch(&self, worker: usize, batch: Vec<RecordWithTime>) {
        let (records, submitted): (Vec<Record>, Vec<Option<SystemTime>>) = batch
            .into_iter()
            .map(|r| (r.record, r.submitted_at))
            .unzip();

        match self.inserter.insert_records(&records).await {
            Ok(()) => {
                self.metrics.record_inserted(records.len());
                tracing::debug!(worker, records = records.len(), "inserted batch");
            }
            Err(e) => {
                self.metrics.record_dropped(records.len());
                tracing::error!(worker, records = records.len(), error = %e, "failed to insert batch");
            }
        }

        if let Some(tracker) = &self.tracker {
            for submitted_at in submitted.into_iter().flatten() {
                tracker.track_time(self.clock.since(submitted_at));
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
