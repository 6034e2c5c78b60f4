mod support;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use batcher::BatchInserter;
use common::clock::{Clock, ManualClock};
use common::config::{Configuration, DeleteConfig, InsertConfig};
use common::db::{Inserter, OperationType};
use common::metrics::{DeleteMetrics, InsertMetrics, RetryMetrics};
use common::model::RecordWithTime;
use common::store::MemoryStore;
use common::testing::wait_until;
use ntest::timeout;
use pruner::BatchDeleter;
use retry::{BackoffPolicy, RetryInsertService};
use support::{init_test_tracing, record};

fn insert_config(max_batch_size: usize) -> InsertConfig {
    InsertConfig {
        parse_workers: 2,
        max_insert_workers: 3,
        max_batch_size,
        max_batch_wait_time: Duration::from_millis(5),
        queue_capacity: 10,
    }
}

fn retrying(
    store: Arc<MemoryStore>,
    max_elapsed: Duration,
    metrics: RetryMetrics,
) -> Arc<dyn Inserter> {
    Arc::new(
        RetryInsertService::new(store)
            .with_backoff(BackoffPolicy {
                initial_interval: Duration::from_millis(1),
                randomization_factor: 0.0,
                multiplier: 1.5,
                max_interval: Duration::from_millis(5),
                max_elapsed_time: max_elapsed,
            })
            .with_metrics(metrics),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[timeout(20000)]
async fn test_transient_store_failures_are_absorbed_by_retry() {
    init_test_tracing();
    let store = Arc::new(MemoryStore::new(1));
    store.fail_next_inserts(2);

    let retry_metrics = RetryMetrics::new();
    let insert_metrics = InsertMetrics::new();
    let inserter = BatchInserter::builder(insert_config(10))
        .inserter(retrying(store.clone(), Duration::from_secs(10), retry_metrics.clone()))
        .metrics(insert_metrics.clone())
        .build()
        .unwrap();
    inserter.start();

    let death = SystemTime::now() + Duration::from_secs(3600);
    for i in 0..25 {
        inserter
            .insert(RecordWithTime::new(
                record(&format!("dev-{i}"), death),
                SystemTime::now(),
            ))
            .await
            .unwrap();
    }
    inserter.stop().await;

    assert_eq!(store.len().await, 25);
    assert_eq!(insert_metrics.records_inserted(), 25);
    assert_eq!(insert_metrics.dropped_records(), 0);
    assert_eq!(insert_metrics.queue_depth(), 0);
    assert_eq!(retry_metrics.retries(OperationType::Insert), 2);
    assert_eq!(
        retry_metrics.query_ends(OperationType::Insert),
        insert_metrics.batches_dispatched()
    );
}

#[tokio::test]
#[timeout(20000)]
async fn test_exhausted_retry_drops_the_batch() {
    init_test_tracing();
    let store = Arc::new(MemoryStore::new(1));
    store.fail_next_inserts(usize::MAX);

    let retry_metrics = RetryMetrics::new();
    let insert_metrics = InsertMetrics::new();
    // one batcher and a window that never fires, so the three records form one batch
    let inserter = BatchInserter::builder(InsertConfig {
        parse_workers: 1,
        max_batch_wait_time: Duration::from_secs(3600),
        ..insert_config(3)
    })
    .inserter(retrying(store.clone(), Duration::from_millis(10), retry_metrics.clone()))
    .metrics(insert_metrics.clone())
    .build()
    .unwrap();
    inserter.start();

    let death = SystemTime::now() + Duration::from_secs(3600);
    for device in ["a", "b", "c"] {
        inserter.insert(record(device, death).into()).await.unwrap();
    }
    inserter.stop().await;

    assert!(store.is_empty().await);
    assert_eq!(insert_metrics.dropped_records(), 3);
    assert_eq!(retry_metrics.query_ends(OperationType::Insert), 1);
    assert!(retry_metrics.retries(OperationType::Insert) > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[timeout(20000)]
async fn test_concurrent_producers_lose_nothing() {
    init_test_tracing();
    let store = Arc::new(MemoryStore::new(4));
    let inserter = Arc::new(
        BatchInserter::builder(insert_config(8))
            .inserter(store.clone())
            .build()
            .unwrap(),
    );
    inserter.start();

    let death = SystemTime::now() + Duration::from_secs(3600);
    let producers = (0..4).map(|p| {
        let inserter = inserter.clone();
        tokio::spawn(async move {
            for i in 0..50 {
                inserter
                    .insert(record(&format!("p{p}-{i}"), death).into())
                    .await
                    .unwrap();
            }
        })
    });
    for result in futures::future::join_all(producers).await {
        result.unwrap();
    }
    inserter.stop().await;

    assert_eq!(store.len().await, 200);
    assert_eq!(inserter.metrics().records_inserted(), 200);
    assert_eq!(inserter.metrics().queue_depth(), 0);
}

#[tokio::test]
#[timeout(20000)]
async fn test_deleter_prunes_only_expired_records_of_its_shard() {
    init_test_tracing();
    let clock = Arc::new(ManualClock::default());
    let now = clock.now();
    let store = Arc::new(MemoryStore::new(2));

    // ids 1..=3 expired, 4..=6 still live; odd ids land on shard 1
    let expired = now - Duration::from_secs(1);
    let live = now + Duration::from_secs(3600);
    store
        .insert_records(&[
            record("a", expired),
            record("b", expired),
            record("c", expired),
            record("d", live),
            record("e", live),
            record("f", live),
        ])
        .await
        .unwrap();

    let metrics = DeleteMetrics::new();
    let deleter = BatchDeleter::builder(DeleteConfig {
        shard: 1,
        max_workers: 2,
        set_capacity: 10,
        delete_wait_time: Duration::from_millis(1),
        get_limit: 0,
        get_poll_interval: Duration::from_millis(10),
    })
    .pruner(store.clone())
    .metrics(metrics.clone())
    .clock(clock.clone())
    .build()
    .unwrap();
    deleter.start();

    wait_until(|| clock.pending_sleeps() == 1).await;
    clock.advance(Duration::from_millis(10));
    wait_until(|| metrics.deletes_succeeded() == 1 && clock.pending_sleeps() == 2).await;

    clock.advance(Duration::from_millis(1));
    wait_until(|| metrics.deletes_succeeded() == 2).await;
    deleter.stop().await;

    let remaining: Vec<_> = store.records().await.iter().map(|r| r.record_id).collect();
    assert_eq!(remaining, vec![2, 4, 5, 6]);
    assert_eq!(metrics.deletes_failed(), 0);
    assert_eq!(metrics.queue_depth(), 0);
}

#[tokio::test]
#[timeout(20000)]
async fn test_pipelines_built_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(
        &mut file,
        br#"
[insert]
parse_workers = 3
max_batch_size = 0
max_batch_wait_time = "2ms"
queue_capacity = 1

[delete]
shard = 4
set_capacity = 50
get_poll_interval = "1h"
"#,
    )
    .unwrap();

    let config = Configuration::load_from_path(file.path()).unwrap();
    let store = Arc::new(MemoryStore::default());

    let inserter = BatchInserter::builder(config.insert.clone())
        .inserter(store.clone())
        .build()
        .unwrap();
    assert_eq!(inserter.config().parse_workers, 3);
    assert_eq!(inserter.config().max_batch_size, 0);
    assert_eq!(inserter.config().queue_capacity, 5);

    let deleter = BatchDeleter::builder(config.delete.clone())
        .pruner(store.clone())
        .build()
        .unwrap();
    assert_eq!(deleter.config().shard, 4);
    assert_eq!(deleter.config().set_capacity, 50);
    assert_eq!(deleter.config().get_poll_interval, Duration::from_secs(3600));

    inserter.start();
    deleter.start();
    let death = SystemTime::now() + Duration::from_secs(60);
    inserter.insert(record("x", death).into()).await.unwrap();
    tokio::join!(inserter.stop(), deleter.stop());
    assert_eq!(store.len().await, 1);
}
