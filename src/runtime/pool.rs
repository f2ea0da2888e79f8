//! Worker pool: a bounded, growable set of threads draining the [`WorkQueue`].
//!
//! The pool starts `min_threads` workers up front. More are only added when the
//! scheduler's growth policy asks for one, and never beyond `max_threads`.
//! Workers idle for longer than `worker_idle_timeout` retire, down to
//! `min_threads`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::{RuntimeError, panic_message};
use crate::runtime::queue::{Pop, Pushed, ScheduledItem, WorkQueue};

pub(crate) struct WorkerPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    queue: WorkQueue,
    threads: Mutex<Threads>,
    min_threads: usize,
    max_threads: usize,
    idle_timeout: Duration,
    diagnostics: Diagnostics,
}

struct Threads {
    active: usize,
    next_index: usize,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(
        min_threads: usize,
        max_threads: usize,
        idle_timeout: Duration,
        diagnostics: Diagnostics,
    ) -> Result<Self, RuntimeError> {
        let pool = Self {
            shared: Arc::new(PoolShared {
                queue: WorkQueue::new(),
                threads: Mutex::new(Threads {
                    active: 0,
                    next_index: 0,
                    handles: Vec::new(),
                }),
                min_threads,
                max_threads,
                idle_timeout,
                diagnostics,
            }),
        };

        for _ in 0..min_threads {
            pool.spawn_worker()?;
        }
        Ok(pool)
    }

    /// Appends an item to the queue, handing it back if the pool is shut down.
    pub(crate) fn enqueue(&self, item: ScheduledItem) -> Result<Pushed, ScheduledItem> {
        self.shared.queue.push(item)
    }

    /// Starts one more worker unless the pool is already at `max_threads`.
    ///
    /// Returns whether a worker was started.
    pub(crate) fn spawn_worker(&self) -> Result<bool, RuntimeError> {
        if self.shared.queue.is_shutdown() {
            return Ok(false);
        }

        let mut threads = self.shared.threads.lock();
        if threads.active >= self.shared.max_threads {
            return Ok(false);
        }
        threads.handles.retain(|h| !h.is_finished());

        let index = threads.next_index;
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("cadence-worker-{index}"))
            .spawn(move || worker_loop(shared, index))?;

        threads.next_index += 1;
        threads.active += 1;
        threads.handles.push(handle);
        tracing::debug!(worker = index, active = threads.active, "worker started");
        Ok(true)
    }

    pub(crate) fn active_threads(&self) -> usize {
        self.shared.threads.lock().active
    }

    pub(crate) fn idle_threads(&self) -> usize {
        self.shared.queue.idle()
    }

    pub(crate) fn queue_depth(&self) -> usize {
        self.shared.queue.len()
    }

    pub(crate) fn dequeued(&self) -> u64 {
        self.shared.queue.dequeued()
    }

    pub(crate) fn max_threads(&self) -> usize {
        self.shared.max_threads
    }

    /// Stops accepting work, lets workers drain what is queued, and joins them.
    ///
    /// A worker calling this does not join itself.
    pub(crate) fn shutdown(&self) {
        self.shared.queue.shutdown();

        let handles = std::mem::take(&mut self.shared.threads.lock().handles);
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PoolShared {
    /// Retires the calling worker if the pool is above its floor.
    fn try_retire(&self) -> bool {
        let mut threads = self.threads.lock();
        if threads.active > self.min_threads {
            threads.active -= 1;
            true
        } else {
            false
        }
    }

    fn exit(&self) {
        let mut threads = self.threads.lock();
        threads.active = threads.active.saturating_sub(1);
    }
}

fn worker_loop(shared: Arc<PoolShared>, index: usize) {
    loop {
        match shared.queue.pop(shared.idle_timeout) {
            Pop::Item(item) => run_item(&shared.diagnostics, index, item),
            Pop::TimedOut => {
                if shared.try_retire() {
                    tracing::debug!(worker = index, "idle worker retired");
                    return;
                }
            }
            Pop::Shutdown => break,
        }
    }

    shared.exit();
    tracing::debug!(worker = index, "worker stopped");
}

/// Runs one payload. A panic is reported and the worker keeps going.
fn run_item(diagnostics: &Diagnostics, index: usize, item: ScheduledItem) {
    if item.is_cancelled() {
        tracing::trace!(worker = index, destination = %item.target, "running item whose signal already fired");
    }

    let target = item.target;
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(item.payload)) {
        diagnostics.report(
            DiagnosticKind::PayloadPanic,
            format!(
                "payload for {target} panicked on worker {index}: {}",
                panic_message(payload.as_ref())
            ),
        );
    }
}
