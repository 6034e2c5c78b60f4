//! Background task ownership for the pipelines.
//!
//! A [`TaskGroup`] holds the long-running tasks of one pipeline. Draining it
//! hands the tasks to a detached drain task, so a caller that stops waiting
//! (a shutdown timeout, a `select!`) never aborts work already handed to the
//! store. Every later [`TaskGroup::drain`] waits on the same drain.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinSet;

pub struct TaskGroup {
    name: &'static str,
    tasks: Mutex<Option<JoinSet<()>>>,
    drained: Arc<watch::Sender<bool>>,
}

impl TaskGroup {
    pub fn new(name: &'static str) -> Self {
        let (drained, _) = watch::channel(false);
        Self {
            name,
            tasks: Mutex::new(Some(JoinSet::new())),
            drained: Arc::new(drained),
        }
    }

    /// Spawn `task` into the group. Returns `false` once draining has begun.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match lock(&self.tasks).as_mut() {
            Some(tasks) => {
                tasks.spawn(task);
                true
            }
            None => false,
        }
    }

    /// Wait until every task in the group has finished.
    ///
    /// The first call starts the drain; dropping this future does not
    /// cancel it.
    pub async fn drain(&self) {
        let mut drained = self.drained.subscribe();

        let tasks = lock(&self.tasks).take();
        if let Some(mut tasks) = tasks {
            let name = self.name;
            let done = self.drained.clone();
            tokio::spawn(async move {
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        tracing::error!(group = name, error = %e, "pipeline task failed");
                    }
                }
                done.send_replace(true);
            });
        }

        // The sender lives in `self`, so this only fails if the group is gone.
        let _ = drained.wait_for(|done| *done).await;
    }

    pub fn is_drained(&self) -> bool {
        *self.drained.borrow()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntest::timeout;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    #[timeout(5000)]
    async fn test_drain_waits_for_tasks() {
        let group = TaskGroup::new("test");
        let (tx, rx) = oneshot::channel::<()>();
        assert!(group.spawn(async move {
            let _ = rx.await;
        }));

        tokio::task::yield_now().await;
        assert!(!group.is_drained());

        tx.send(()).unwrap();
        group.drain().await;
        assert!(group.is_drained());
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn test_cancelled_drain_keeps_tasks_running() {
        let group = TaskGroup::new("test");
        let (release, released) = oneshot::channel::<()>();
        let (finished_tx, finished) = oneshot::channel::<()>();
        group.spawn(async move {
            let _ = released.await;
            let _ = finished_tx.send(());
        });

        let cancelled = tokio::time::timeout(Duration::from_millis(20), group.drain()).await;
        assert!(cancelled.is_err());
        assert!(!group.spawn(async {}));

        release.send(()).unwrap();
        finished.await.unwrap();
        group.drain().await;
        assert!(group.is_drained());
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn test_drain_of_empty_group_returns() {
        let group = TaskGroup::new("test");
        group.drain().await;
        group.drain().await;
        assert!(group.is_drained());
    }
}
