//! Thread-safe FIFO of scheduled items for the worker pool.
//!
//! Workers park on the queue's condition variable when it is empty. The queue
//! also keeps the idle-worker count and a running dequeue counter, which the
//! growth policy reads to tell a busy pool from a stalled one.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancellationSignal;

/// A unit of work handed to a thread.
pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Where an item is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    WorkerPool,
    Exclusive(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::WorkerPool => f.write_str("worker-pool"),
            Target::Exclusive(name) => write!(f, "exclusive:{name}"),
        }
    }
}

/// One queued continuation.
///
/// The cancellation signal travels with the item for the payload to observe; an
/// item whose signal already fired is still executed.
pub(crate) struct ScheduledItem {
    pub(crate) target: Target,
    pub(crate) payload: Job,
    pub(crate) cancellation: Option<CancellationSignal>,
}

impl ScheduledItem {
    pub(crate) fn new(
        target: Target,
        payload: Job,
        cancellation: Option<CancellationSignal>,
    ) -> Self {
        Self {
            target,
            payload,
            cancellation,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationSignal::is_triggered)
    }
}

/// Queue state observed right after a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pushed {
    pub(crate) depth: usize,
    pub(crate) idle: usize,
}

/// Result of a worker waiting for work.
pub(crate) enum Pop {
    Item(ScheduledItem),
    /// Nothing arrived within the idle timeout.
    TimedOut,
    /// Shut down and fully drained.
    Shutdown,
}

pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

struct QueueState {
    items: VecDeque<ScheduledItem>,
    idle: usize,
    dequeued: u64,
    shutdown: bool,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                idle: 0,
                dequeued: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueues an item and wakes one parked worker if there is one.
    ///
    /// Hands the item back if the queue is shut down.
    pub(crate) fn push(&self, item: ScheduledItem) -> Result<Pushed, ScheduledItem> {
        let pushed = {
            let mut state = self.state.lock();
            if state.shutdown {
                return Err(item);
            }
            state.items.push_back(item);
            Pushed {
                depth: state.items.len(),
                idle: state.idle,
            }
        };

        if pushed.idle > 0 {
            self.available.notify_one();
        }
        Ok(pushed)
    }

    /// Dequeues the next item, parking up to `idle_timeout` while empty.
    ///
    /// Items queued before shutdown are still handed out. A timeout too large
    /// to express as an `Instant` parks without a deadline.
    pub(crate) fn pop(&self, idle_timeout: Duration) -> Pop {
        let deadline = Instant::now().checked_add(idle_timeout);
        let mut state = self.state.lock();

        loop {
            if let Some(item) = state.items.pop_front() {
                state.dequeued += 1;
                return Pop::Item(item);
            }
            if state.shutdown {
                return Pop::Shutdown;
            }

            state.idle += 1;
            let timed_out = match deadline {
                Some(deadline) => self.available.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.available.wait(&mut state);
                    false
                }
            };
            state.idle -= 1;

            if timed_out && state.items.is_empty() && !state.shutdown {
                return Pop::TimedOut;
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub(crate) fn idle(&self) -> usize {
        self.state.lock().idle
    }

    /// Total items handed to workers so far.
    pub(crate) fn dequeued(&self) -> u64 {
        self.state.lock().dequeued
    }

    /// Stops accepting items and wakes every parked worker.
    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.available.notify_all();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }
}
