//! Threads for slow non-RT work that the controlling thread should not do
//! itself (re-decoding files, big allocations). They exist only while
//! somebody holds a handle.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use crux_shared::BridgeError;
use lazy_static::lazy_static;
use tracing::{debug, error};

pub type Job = Box<dyn FnOnce() + Send>;

lazy_static! {
    static ref GLOBAL_UI_POOL: Arc<UiThreadPool> = Arc::new(UiThreadPool::new());
}

struct UiThread {
    tx: Sender<Job>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    threads: Vec<UiThread>,
    next: usize,
    in_flight: usize,
    generation: u64,
}

pub struct UiThreadPool {
    state: Mutex<State>,
    size: usize,
}

/// Assignment to one pool thread. Dropping it releases the pool.
pub struct UiThreadHandle {
    tx: Option<Sender<Job>>,
    index: usize,
    pool: Arc<UiThreadPool>,
}

/// Half the hardware threads when there are more than two, never fewer than two.
pub fn ui_thread_count(hardware: usize) -> usize {
    let n = if hardware > 2 { hardware / 2 } else { hardware };
    n.max(2)
}

impl UiThreadPool {
    pub fn new() -> Self {
        Self::with_size(ui_thread_count(num_cpus::get()))
    }

    pub fn with_size(size: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            size: size.max(1),
        }
    }

    pub fn instance() -> Arc<UiThreadPool> {
        GLOBAL_UI_POOL.clone()
    }

    /// Hand out the next thread round-robin, starting the set if it is down.
    pub fn acquire(self: &Arc<Self>) -> Result<UiThreadHandle, BridgeError> {
        let mut state = self.lock();
        if state.threads.is_empty() {
            for i in 0..self.size {
                let name = format!("crux uitask {i}");
                let (tx, rx) = crossbeam_channel::unbounded::<Job>();
                let handle = thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || run_jobs(rx))
                    .map_err(|source| BridgeError::ThreadSpawn { name, source })?;
                state.threads.push(UiThread { tx, handle });
            }
            state.next = 0;
            state.generation += 1;
            debug!(threads = self.size, generation = state.generation, "ui threads started");
        }

        let index = state.next;
        state.next = (state.next + 1) % state.threads.len();
        state.in_flight += 1;
        Ok(UiThreadHandle {
            tx: Some(state.threads[index].tx.clone()),
            index,
            pool: self.clone(),
        })
    }

    fn release(&self) {
        let stopped = {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            if state.in_flight > 0 {
                return;
            }
            state.next = 0;
            std::mem::take(&mut state.threads)
        };
        if stopped.is_empty() {
            return;
        }

        // Closing every sender ends the job loops.
        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = stopped.into_iter().map(|t| t.handle).collect();
        for handle in handles {
            if handle.thread().id() == current {
                // Released from one of our own jobs; the thread finishes on its own.
                continue;
            }
            let _ = handle.join();
        }
        debug!("ui threads stopped");
    }

    pub fn thread_count(&self) -> usize {
        self.lock().threads.len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for UiThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl UiThreadHandle {
    /// Run `job` on the assigned thread.
    pub fn execute(&self, job: Job) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(job);
        }
    }

    /// Run `job` on the assigned thread and release the handle from there
    /// once it finishes.
    pub fn execute_and_release(self, job: Job) {
        let Some(tx) = self.tx.clone() else {
            return;
        };
        let _ = tx.send(Box::new(move || {
            job();
            drop(self);
        }));
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn release(self) {}
}

impl Drop for UiThreadHandle {
    fn drop(&mut self) {
        self.tx.take();
        self.pool.release();
    }
}

fn run_jobs(rx: Receiver<Job>) {
    for job in rx {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("ui pool job panicked");
        }
    }
}
