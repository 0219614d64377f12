//! Opaque byte messages between a node and its own UI.
//!
//! UI → processor messages ride the node's execution queue. Processor → UI
//! messages are length-prefixed frames in a byte ring that the controlling
//! thread drains on refresh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::exec_queue::ExecSender;

const HEADER: usize = 4;

/// UI-side sender. Dead once the executor tears down.
#[derive(Clone)]
pub struct GuiToProcessor {
    queue: Weak<ExecSender>,
}

impl GuiToProcessor {
    pub(crate) fn new(queue: Weak<ExecSender>) -> Self {
        Self { queue }
    }

    /// Deliver `message` to the node at its next tick. False if the node is
    /// gone or its queue is full.
    pub fn send(&self, message: Vec<u8>) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        queue
            .enqueue(Box::new(move |node| node.process_message(&message)))
            .is_ok()
    }

    pub fn send_typed<T: Serialize>(&self, value: &T) -> bool {
        match bincode::serialize(value) {
            Ok(bytes) => self.send(bytes),
            Err(_) => false,
        }
    }
}

/// Processor-side writer. Never blocks; a message that does not fit is
/// dropped and counted.
pub struct ProcessorBus {
    producer: HeapProd<u8>,
    scratch: Vec<u8>,
    dropped: Arc<AtomicU64>,
}

impl ProcessorBus {
    pub fn send(&mut self, message: &[u8]) -> bool {
        let Ok(len) = u32::try_from(message.len()) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        if self.producer.vacant_len() < HEADER + message.len() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.producer.push_slice(&len.to_le_bytes());
        self.producer.push_slice(message);
        true
    }

    /// Encode into a buffer reserved up front, then send. Values larger
    /// than the reservation grow it.
    pub fn send_typed<T: Serialize>(&mut self, value: &T) -> bool {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        let ok = bincode::serialize_into(&mut scratch, value).is_ok() && self.send(&scratch);
        self.scratch = scratch;
        ok
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Controlling-thread reader of processor frames.
pub struct ProcessorMessages {
    consumer: HeapCons<u8>,
    pending: Option<usize>,
    dropped: Arc<AtomicU64>,
}

impl ProcessorMessages {
    /// Hand every complete frame to `sink`, in order.
    pub fn drain(&mut self, mut sink: impl FnMut(&[u8])) -> usize {
        let mut count = 0;
        loop {
            let len = match self.pending {
                Some(len) => len,
                None => {
                    if self.consumer.occupied_len() < HEADER {
                        break;
                    }
                    let mut header = [0u8; HEADER];
                    self.consumer.pop_slice(&mut header);
                    let len = u32::from_le_bytes(header) as usize;
                    self.pending = Some(len);
                    len
                }
            };
            if self.consumer.occupied_len() < len {
                break;
            }
            let mut body = vec![0u8; len];
            self.consumer.pop_slice(&mut body);
            self.pending = None;
            sink(&body);
            count += 1;
        }
        count
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub fn processor_bus(capacity: usize) -> (ProcessorBus, ProcessorMessages) {
    let (producer, consumer) = HeapRb::<u8>::new(capacity.max(HEADER + 1)).split();
    let dropped = Arc::new(AtomicU64::new(0));
    (
        ProcessorBus {
            producer,
            scratch: Vec::with_capacity(256),
            dropped: dropped.clone(),
        },
        ProcessorMessages {
            consumer,
            pending: None,
            dropped,
        },
    )
}

pub fn decode<T: DeserializeOwned>(message: &[u8]) -> Option<T> {
    bincode::deserialize(message).ok()
}
