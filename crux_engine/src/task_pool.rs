use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use crux_shared::{BridgeConfig, BridgeError};
use lazy_static::lazy_static;
use tracing::{debug, error, info};

pub type Task = Box<dyn FnOnce() + Send>;

/// A task the pool could not accept. Carries the task back to the caller.
pub struct Rejected(pub Task);

impl std::fmt::Debug for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Rejected")
    }
}

lazy_static! {
    static ref GLOBAL_POOL: Mutex<Option<Arc<TaskPool>>> = Mutex::new(None);
}

struct Counters {
    completed: AtomicU64,
    panicked: AtomicU64,
}

/// Fixed set of background threads fed by a bounded queue. Posting never
/// blocks, which is what makes it usable from the audio thread.
pub struct TaskPool {
    tx: Sender<Task>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    thread_count: usize,
}

impl TaskPool {
    pub fn new(threads: usize, capacity: usize, poll: Duration) -> Result<Self, BridgeError> {
        let (tx, rx) = crossbeam_channel::bounded::<Task>(capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters {
            completed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        });

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let name = format!("crux task {i}");
            let rx = rx.clone();
            let thread_running = running.clone();
            let counters = counters.clone();
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(rx, thread_running, counters, poll));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    running.store(false, Ordering::Release);
                    for h in handles {
                        let _ = h.join();
                    }
                    return Err(BridgeError::ThreadSpawn { name, source });
                }
            }
        }
        info!(threads, capacity, "task pool started");

        Ok(Self {
            tx,
            running,
            threads: Mutex::new(handles),
            counters,
            thread_count: threads,
        })
    }

    pub fn from_config(config: &BridgeConfig) -> Result<Self, BridgeError> {
        Self::new(config.worker_threads, config.task_queue_capacity, config.task_poll_interval())
    }

    /// Queue a task. Never blocks; a full or stopped pool hands it back.
    pub fn post(&self, task: Task) -> Result<(), Rejected> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Rejected(task));
        }
        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(t)) | Err(TrySendError::Disconnected(t)) => Err(Rejected(t)),
        }
    }

    /// Stop and join every thread. Tasks still queued are dropped unrun.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let handles: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let current = thread::current().id();
        for h in handles {
            if h.thread().id() != current {
                let _ = h.join();
            }
        }
        info!(completed = self.completed(), panicked = self.panicked(), "task pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.counters.panicked.load(Ordering::Relaxed)
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// The process-wide pool, created from the default configuration on
    /// first use (or again after `shutdown_instance`).
    pub fn instance() -> Result<Arc<TaskPool>, BridgeError> {
        let mut global = GLOBAL_POOL.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = global.as_ref() {
            return Ok(pool.clone());
        }
        let pool = Arc::new(TaskPool::from_config(&BridgeConfig::default())?);
        *global = Some(pool.clone());
        Ok(pool)
    }

    pub fn shutdown_instance() {
        let pool = GLOBAL_POOL.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pool) = pool {
            pool.shutdown();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<Task>, running: Arc<AtomicBool>, counters: Arc<Counters>, poll: Duration) {
    debug!("task thread up");
    while running.load(Ordering::Acquire) {
        match rx.recv_timeout(poll) {
            Ok(task) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                match panic::catch_unwind(AssertUnwindSafe(task)) {
                    Ok(()) => {
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        counters.panicked.fetch_add(1, Ordering::Relaxed);
                        error!("background task panicked");
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("task thread down");
}
