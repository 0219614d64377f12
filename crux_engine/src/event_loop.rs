//! The controlling thread's loop: jobs posted from other threads and a set of
//! periodic callbacks, all run on the thread that owns the loop.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

type UiJob = Box<dyn FnOnce() + Send>;
type TimerCallback = Rc<RefCell<dyn FnMut()>>;

/// Posts jobs to the controlling thread from anywhere.
#[derive(Clone)]
pub struct UiDispatcher {
    tx: Sender<UiJob>,
}

impl UiDispatcher {
    /// Returns false once the loop is gone.
    pub fn run_async(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(job)).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConnection(u64);

struct Timer {
    id: u64,
    callback: TimerCallback,
}

pub struct EventLoop {
    tx: Sender<UiJob>,
    rx: Receiver<UiJob>,
    timers: RefCell<Vec<Timer>>,
    next_timer: Cell<u64>,
    refresh: Duration,
}

impl EventLoop {
    pub fn new(refresh: Duration) -> Rc<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        Rc::new(Self {
            tx,
            rx,
            timers: RefCell::new(Vec::new()),
            next_timer: Cell::new(0),
            refresh,
        })
    }

    pub fn dispatcher(&self) -> UiDispatcher {
        UiDispatcher { tx: self.tx.clone() }
    }

    /// Register a callback fired on every refresh.
    pub fn connect_timer(&self, callback: impl FnMut() + 'static) -> TimerConnection {
        let id = self.next_timer.get();
        self.next_timer.set(id + 1);
        self.timers.borrow_mut().push(Timer {
            id,
            callback: Rc::new(RefCell::new(callback)),
        });
        TimerConnection(id)
    }

    pub fn disconnect(&self, connection: TimerConnection) -> bool {
        let mut timers = self.timers.borrow_mut();
        let before = timers.len();
        timers.retain(|t| t.id != connection.0);
        timers.len() != before
    }

    pub fn timer_count(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Run every job posted so far.
    pub fn process_events(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Fire all timers once. Callbacks may connect or disconnect timers.
    pub fn fire_timers(&self) {
        let snapshot: Vec<(u64, TimerCallback)> = self
            .timers
            .borrow()
            .iter()
            .map(|t| (t.id, t.callback.clone()))
            .collect();
        for (id, callback) in snapshot {
            let live = self.timers.borrow().iter().any(|t| t.id == id);
            if !live {
                continue;
            }
            if let Ok(mut cb) = callback.try_borrow_mut() {
                cb();
            }
        }
    }

    /// One full refresh: pending jobs, then timers.
    pub fn tick(&self) {
        self.process_events();
        self.fire_timers();
    }

    /// Serve jobs as they arrive and fire timers every refresh period until
    /// `duration` has elapsed.
    pub fn run_for(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut next_refresh = Instant::now() + self.refresh;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if now >= next_refresh {
                self.fire_timers();
                next_refresh = now + self.refresh;
            }
            let wait = next_refresh.min(deadline).saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(wait) {
                Ok(job) => {
                    job();
                    self.process_events();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.tick();
    }
}
