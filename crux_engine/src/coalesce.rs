//! Latest-value-wins hand-off between exactly two threads.
//!
//! Each slot is a triple buffer: the writer owns one cell, the reader owns
//! another, and the third is exchanged through a single atomic byte that also
//! carries a "fresh" flag. Both sides are wait-free, nothing allocates after
//! construction, and at most one unread value is pending. A write that lands
//! before the reader drains simply replaces the pending one.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const INDEX_MASK: u8 = 0b011;
const FRESH: u8 = 0b100;

struct Shared<T> {
    cells: [UnsafeCell<T>; 3],
    /// Index of the middle cell, plus `FRESH` when it holds an unread write.
    middle: AtomicU8,
}

// Each cell is only touched by the side currently owning its index.
unsafe impl<T: Send> Sync for Shared<T> {}

pub struct SlotWriter<T> {
    shared: Arc<Shared<T>>,
    back: u8,
}

pub struct SlotReader<T> {
    shared: Arc<Shared<T>>,
    front: u8,
}

/// Create a slot whose cells start at `init`. The reader reports nothing
/// until the first write.
pub fn slot<T: Copy + Send>(init: T) -> (SlotWriter<T>, SlotReader<T>) {
    let shared = Arc::new(Shared {
        cells: [UnsafeCell::new(init), UnsafeCell::new(init), UnsafeCell::new(init)],
        middle: AtomicU8::new(1),
    });
    (
        SlotWriter { shared: shared.clone(), back: 0 },
        SlotReader { shared, front: 2 },
    )
}

impl<T: Copy + Send> SlotWriter<T> {
    /// Publish `value`, replacing anything the reader has not picked up yet.
    pub fn write(&mut self, value: T) {
        unsafe { *self.shared.cells[self.back as usize].get() = value };
        let previous = self.shared.middle.swap(self.back | FRESH, Ordering::AcqRel);
        self.back = previous & INDEX_MASK;
    }
}

impl<T: Copy + Send> SlotReader<T> {
    /// Take the newest unread value, if any.
    pub fn read_latest(&mut self) -> Option<T> {
        if self.shared.middle.load(Ordering::Relaxed) & FRESH == 0 {
            return None;
        }
        let previous = self.shared.middle.swap(self.front, Ordering::AcqRel);
        self.front = previous & INDEX_MASK;
        Some(unsafe { *self.shared.cells[self.front as usize].get() })
    }

    pub fn has_update(&self) -> bool {
        self.shared.middle.load(Ordering::Acquire) & FRESH != 0
    }
}
