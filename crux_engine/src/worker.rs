//! Blocking work requested from the audio thread.
//!
//! A request runs on the task pool, hops to the controlling thread, and
//! lands in the node's execution queue. Every hop only holds weak references,
//! so a node torn down in the meantime simply never sees the result.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tracing::trace;

use crate::event_loop::UiDispatcher;
use crate::exec_queue::{ExecSender, ExecTask};
use crate::node::NodeCell;
use crate::task_pool::{Rejected, TaskPool};

#[derive(Default)]
pub struct WorkerStats {
    outstanding: AtomicUsize,
    rejected: AtomicU64,
    discarded: AtomicU64,
    applied: AtomicU64,
}

impl WorkerStats {
    /// Requests posted whose outcome is not settled yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Requests the pool refused.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Results dropped because the node was gone or its queue was full.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Results handed to the node's execution queue.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    fn settle(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Clone)]
pub struct WorkerHandle {
    pool: Arc<TaskPool>,
    node: Weak<NodeCell>,
    queue: Weak<ExecSender>,
    dispatcher: UiDispatcher,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    pub(crate) fn new(
        pool: Arc<TaskPool>,
        node: Weak<NodeCell>,
        queue: Weak<ExecSender>,
        dispatcher: UiDispatcher,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            pool,
            node,
            queue,
            dispatcher,
            stats,
        }
    }

    /// Run `work` in the background. If it yields a task, that task runs
    /// against the node at the start of a later tick. Returns false when the
    /// pool is saturated.
    pub fn request<F>(&self, work: F) -> bool
    where
        F: FnOnce() -> Option<ExecTask> + Send + 'static,
    {
        let node = self.node.clone();
        let queue = self.queue.clone();
        let dispatcher = self.dispatcher.clone();
        let stats = self.stats.clone();
        self.stats.outstanding.fetch_add(1, Ordering::AcqRel);

        let posted = self.pool.post(Box::new(move || {
            if node.strong_count() == 0 {
                stats.settle();
                return;
            }
            let Some(result) = work() else {
                stats.settle();
                return;
            };
            let relay_stats = stats.clone();
            let relayed = dispatcher.run_async(move || {
                let queue = queue.upgrade().filter(|_| node.strong_count() > 0);
                match queue {
                    Some(queue) => match queue.enqueue(result) {
                        Ok(()) => {
                            relay_stats.applied.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            relay_stats.discarded.fetch_add(1, Ordering::Relaxed);
                            trace!("execution queue full, worker result dropped");
                        }
                    },
                    None => {
                        relay_stats.discarded.fetch_add(1, Ordering::Relaxed);
                        trace!("node gone, worker result dropped");
                    }
                }
                relay_stats.settle();
            });
            if !relayed {
                stats.discarded.fetch_add(1, Ordering::Relaxed);
                stats.settle();
            }
        }));

        match posted {
            Ok(()) => true,
            Err(Rejected(_task)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                self.stats.settle();
                false
            }
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }
}
