//! Ordered completion executor.
//!
//! A fixed pool of worker tasks, each draining its own queue. Work for a
//! ledger always lands on the worker selected by its id, so the outcomes of
//! one ledger are applied one at a time and in submission order while
//! different ledgers proceed in parallel.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use quorumlog_cluster::LedgerId;
use tokio::sync::mpsc;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Key-ordered pool of worker tasks.
///
/// Cheaply cloneable; clones submit to the same workers. Workers exit once
/// every clone has been dropped.
#[derive(Clone)]
pub(crate) struct OrderedExecutor {
    workers: Arc<[mpsc::UnboundedSender<Task>]>,
}

impl std::fmt::Debug for OrderedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedExecutor").field("workers", &self.workers.len()).finish()
    }
}

impl OrderedExecutor {
    /// Spawns `num_workers` workers on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub(crate) fn new(num_workers: usize) -> Self {
        let workers: Vec<_> = (0..num_workers.max(1))
            .map(|worker| {
                let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
                tokio::spawn(async move {
                    while let Some(task) = rx.recv().await {
                        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                            tracing::error!(worker, "ordered executor task panicked");
                        }
                    }
                    tracing::debug!(worker, "ordered executor worker stopped");
                });
                tx
            })
            .collect();
        Self { workers: workers.into() }
    }

    /// Queues `task` behind all earlier work for `key`.
    pub(crate) fn submit(&self, key: LedgerId, task: impl FnOnce() + Send + 'static) {
        let worker = self.worker_for(key);
        if self.workers[worker].send(Box::new(task)).is_err() {
            tracing::warn!(ledger_id = %key, worker, "executor worker gone, dropping task");
        }
    }

    fn worker_for(&self, key: LedgerId) -> usize {
        let count = i64::try_from(self.workers.len()).unwrap_or(1);
        usize::try_from(key.0.rem_euclid(count)).unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use parking_lot::Mutex;
    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn tasks_for_one_key_run_in_order() {
        let executor = OrderedExecutor::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = Arc::clone(&seen);
            executor.submit(LedgerId::from(7), move || seen.lock().push(i));
        }
        let (tx, rx) = oneshot::channel();
        executor.submit(LedgerId::from(7), move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();

        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn panicking_task_does_not_stop_worker() {
        let executor = OrderedExecutor::new(1);
        executor.submit(LedgerId::from(1), || panic!("task failure"));
        let (tx, rx) = oneshot::channel();
        executor.submit(LedgerId::from(1), move || {
            let _ = tx.send(5);
        });
        assert_eq!(rx.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn negative_keys_select_a_worker() {
        let executor = OrderedExecutor::new(3);
        assert!(executor.worker_for(LedgerId::from(-1)) < 3);
    }
}
