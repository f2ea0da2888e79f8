//! Affinity contexts: where a continuation is allowed to run.
//!
//! There is no thread-local "current context". Each step of a future receives
//! the context it runs on explicitly (through its [`Cx`](crate::Cx)), and
//! suspension captures it from there. That keeps capture and restore a plain
//! data flow.
//!
//! - [`AffinityContext::None`]: no constraint; continuations go to the worker pool.
//! - [`AffinityContext::Exclusive`]: one dedicated thread draining a private FIFO,
//!   the model of a UI thread or any single-owner resource.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use futures::channel::oneshot;
use parking_lot::{Condvar, Mutex};

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::{RuntimeError, panic_message};
use crate::runtime::queue::{Job, ScheduledItem, Target};

/// The resumption constraint captured at a suspension point.
#[derive(Clone, Default)]
pub enum AffinityContext {
    /// Resume on any worker pool thread.
    #[default]
    None,
    /// Resume on the owning thread of this context, in post order.
    Exclusive(ExclusiveContext),
}

impl AffinityContext {
    /// The exclusive context, if any.
    pub fn exclusive(&self) -> Option<&ExclusiveContext> {
        match self {
            AffinityContext::None => None,
            AffinityContext::Exclusive(ctx) => Some(ctx),
        }
    }

    /// Whether the calling thread is the owning thread of this context.
    ///
    /// Always `false` for [`AffinityContext::None`].
    pub fn is_current(&self) -> bool {
        self.exclusive().is_some_and(ExclusiveContext::is_current)
    }

    pub(crate) fn target(&self) -> Target {
        match self {
            AffinityContext::None => Target::WorkerPool,
            AffinityContext::Exclusive(ctx) => Target::Exclusive(ctx.shared.name.clone()),
        }
    }
}

impl fmt::Debug for AffinityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AffinityContext::None => f.write_str("None"),
            AffinityContext::Exclusive(ctx) => f.debug_tuple("Exclusive").field(&ctx.name()).finish(),
        }
    }
}

impl From<ExclusiveContext> for AffinityContext {
    fn from(ctx: ExclusiveContext) -> Self {
        AffinityContext::Exclusive(ctx)
    }
}

/// A context backed by one dedicated thread.
///
/// Every posted continuation runs on that thread, strictly in post order.
/// Clones share the thread; it stops once every clone is dropped (or
/// [`shutdown`](Self::shutdown) is called) and the queue is drained.
#[derive(Clone)]
pub struct ExclusiveContext {
    shared: Arc<ExclusiveShared>,
}

struct ExclusiveShared {
    name: String,
    queue: Arc<ExclusiveQueue>,
    owner: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
    deadlock_detection: bool,
}

struct ExclusiveQueue {
    state: Mutex<ExclusiveState>,
    ready: Condvar,
    diagnostics: Diagnostics,
}

struct ExclusiveState {
    items: VecDeque<ScheduledItem>,
    shutdown: bool,
}

impl ExclusiveContext {
    /// Starts the owning thread.
    ///
    /// With `deadlock_detection` on, [`send`](Self::send) and the bridge fail
    /// fast with [`RuntimeError::SelfBlockDeadlock`] when called from the owning
    /// thread instead of hanging.
    pub fn new(
        name: impl Into<String>,
        diagnostics: Diagnostics,
        deadlock_detection: bool,
    ) -> Result<Self, RuntimeError> {
        let name = name.into();
        let queue = Arc::new(ExclusiveQueue {
            state: Mutex::new(ExclusiveState {
                items: VecDeque::new(),
                shutdown: false,
            }),
            ready: Condvar::new(),
            diagnostics,
        });

        let worker = queue.clone();
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(format!("cadence-exclusive-{name}"))
            .spawn(move || run(&thread_name, worker))?;
        let owner = handle.thread().id();

        tracing::debug!(context = %name, "exclusive context started");

        Ok(Self {
            shared: Arc::new(ExclusiveShared {
                name,
                queue,
                owner,
                thread: Mutex::new(Some(handle)),
                deadlock_detection,
            }),
        })
    }

    /// The name given at creation; it also names the owning thread.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the calling thread is this context's owning thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    /// Appends `continuation` to the FIFO and wakes the owner. Never blocks.
    pub fn post<F>(&self, continuation: F) -> Result<(), RuntimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(ScheduledItem::new(
            Target::Exclusive(self.shared.name.clone()),
            Box::new(continuation),
            None,
        ))
    }

    /// Runs `continuation` on the owning thread and blocks until it returns.
    ///
    /// Called from the owning thread this can only deadlock (the thread would
    /// wait for itself). With deadlock detection on it returns
    /// [`RuntimeError::SelfBlockDeadlock`] instead. A panic in `continuation` is
    /// resumed on the caller.
    pub fn send<F, R>(&self, continuation: F) -> Result<R, RuntimeError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.check_self_block()?;

        let (tx, rx) = oneshot::channel();
        self.post(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(continuation));
            let _ = tx.send(result);
        })?;

        match futures::executor::block_on(rx) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(oneshot::Canceled) => Err(RuntimeError::Shutdown),
        }
    }

    /// Stops accepting work. Already queued continuations still run.
    pub fn shutdown(&self) {
        self.shared.queue.close();
    }

    /// Continuations waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.queue.state.lock().items.len()
    }

    pub(crate) fn check_self_block(&self) -> Result<(), RuntimeError> {
        if self.shared.deadlock_detection && self.is_current() {
            return Err(RuntimeError::SelfBlockDeadlock {
                context: self.shared.name.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn enqueue(&self, item: ScheduledItem) -> Result<(), RuntimeError> {
        let rejected = {
            let mut state = self.shared.queue.state.lock();
            if state.shutdown {
                Some(item)
            } else {
                state.items.push_back(item);
                None
            }
        };

        match rejected {
            None => {
                self.shared.queue.ready.notify_one();
                Ok(())
            }
            Some(item) => {
                tracing::warn!(context = %self.shared.name, "exclusive context is shut down; dropping continuation");
                drop(item);
                Err(RuntimeError::Shutdown)
            }
        }
    }
}

impl fmt::Debug for ExclusiveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveContext")
            .field("name", &self.shared.name)
            .field("owner", &self.shared.owner)
            .finish()
    }
}

impl ExclusiveQueue {
    fn close(&self) {
        self.state.lock().shutdown = true;
        self.ready.notify_all();
    }

    /// Next item in post order, or `None` once shut down and drained.
    fn next(&self) -> Option<ScheduledItem> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.shutdown {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }
}

impl Drop for ExclusiveShared {
    fn drop(&mut self) {
        self.queue.close();

        if thread::current().id() == self.owner {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run(name: &str, queue: Arc<ExclusiveQueue>) {
    while let Some(item) = queue.next() {
        let payload: Job = item.payload;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(payload)) {
            queue.diagnostics.report(
                DiagnosticKind::PayloadPanic,
                format!(
                    "continuation on exclusive context `{name}` panicked: {}",
                    panic_message(payload.as_ref())
                ),
            );
        }
    }

    tracing::debug!(context = %name, "exclusive context stopped");
}
