//! Per-node execution queue.
//!
//! The controlling thread enqueues closures; the audio thread runs them, in
//! order, at the start of the node's next tick. A spent closure still owns
//! whatever it captured (payloads, replaced buffers), so the audio side sends
//! it back over a bounded channel and the controlling thread drops it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::node::{NodeCell, ProcessNode};

pub type ExecTask = Box<dyn FnMut(&mut dyn ProcessNode) + Send>;

/// Build a task that only runs if the node is an `N`.
pub fn for_node<N, F>(mut f: F) -> ExecTask
where
    N: ProcessNode + 'static,
    F: FnMut(&mut N) + Send + 'static,
{
    Box::new(move |node: &mut dyn ProcessNode| {
        if let Some(n) = node.as_any_mut().downcast_mut::<N>() {
            f(n);
        }
    })
}

/// Things the audio thread is done with and must not free itself.
pub enum Garbage {
    Task(ExecTask),
    Node(Arc<NodeCell>),
    /// Already boxed audio-side state, moved over without allocating.
    Other(Box<dyn Send>),
}

pub struct ExecSender {
    producer: Mutex<HeapProd<ExecTask>>,
}

impl ExecSender {
    /// Never blocks. A full queue hands the task back.
    pub fn enqueue(&self, task: ExecTask) -> Result<(), ExecTask> {
        let mut producer = self.producer.lock().unwrap_or_else(PoisonError::into_inner);
        producer.try_push(task)
    }

    pub fn pending(&self) -> usize {
        self.producer.lock().unwrap_or_else(PoisonError::into_inner).occupied_len()
    }
}

pub struct ExecReceiver {
    consumer: HeapCons<ExecTask>,
    garbage: Sender<Garbage>,
    realtime_frees: Arc<AtomicU64>,
}

impl ExecReceiver {
    /// Run every queued task against `node`, oldest first.
    pub fn run_all(&mut self, node: &mut dyn ProcessNode) -> usize {
        let mut ran = 0;
        while let Some(mut task) = self.consumer.try_pop() {
            task(&mut *node);
            ran += 1;
            self.dispose(Garbage::Task(task));
        }
        ran
    }

    /// Hand something to the controlling thread for release. If the garbage
    /// channel is full the drop happens here and is counted.
    pub fn dispose(&self, garbage: Garbage) {
        match self.garbage.try_send(garbage) {
            Ok(()) => {}
            Err(TrySendError::Full(g)) | Err(TrySendError::Disconnected(g)) => {
                self.realtime_frees.fetch_add(1, Ordering::Relaxed);
                drop(g);
            }
        }
    }

    pub fn realtime_frees(&self) -> Arc<AtomicU64> {
        self.realtime_frees.clone()
    }

    /// Send the receiver itself home, with any tasks that never ran.
    pub fn retire(self: Box<Self>) {
        let garbage = self.garbage.clone();
        let frees = self.realtime_frees.clone();
        if garbage.try_send(Garbage::Other(self)).is_err() {
            frees.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Controlling-thread end of the garbage channel.
pub struct GarbageCollector {
    rx: Receiver<Garbage>,
}

impl GarbageCollector {
    /// Drop everything the audio thread has handed back.
    pub fn collect(&self) -> usize {
        self.rx.try_iter().map(drop).count()
    }
}

pub fn execution_queue(capacity: usize, garbage_capacity: usize) -> (ExecSender, ExecReceiver, GarbageCollector) {
    let (producer, consumer) = HeapRb::<ExecTask>::new(capacity).split();
    let (garbage_tx, garbage_rx) = crossbeam_channel::bounded(garbage_capacity);
    (
        ExecSender { producer: Mutex::new(producer) },
        ExecReceiver {
            consumer,
            garbage: garbage_tx,
            realtime_frees: Arc::new(AtomicU64::new(0)),
        },
        GarbageCollector { rx: garbage_rx },
    )
}
