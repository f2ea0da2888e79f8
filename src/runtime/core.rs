//! The runtime: owner of the worker pool, the timer thread and the scheduler.
//!
//! A [`Runtime`] is the entry point most callers need. It hands out futures,
//! exclusive contexts and timed cancellations, and bridges back to synchronous
//! code through [`Runtime::block_on`]. Dropping it stops the timer thread,
//! lets the workers drain whatever is already queued, and joins them.

use std::time::Duration;

use crate::bridge;
use crate::builder::RuntimeBuilder;
use crate::cancel::CancellationSignal;
use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::error::{RuntimeError, StepError};
use crate::runtime::{AffinityContext, ExclusiveContext, Scheduler};
use crate::task::{Cx, FutureHandle, Outcome, Promise};
use crate::timer::CancelAfter;

/// A running cooperative runtime.
///
/// # Example
/// ```ignore
/// let rt = Runtime::builder().min_threads(2).build()?;
/// let future = rt.submit(|_cx| Ok(6 * 7), None);
/// assert_eq!(rt.block_on(&future)?.completed(), Some(42));
/// ```
pub struct Runtime {
    scheduler: Scheduler,
}

impl Runtime {
    /// A runtime with [`Config::default`], reporting to the process-wide
    /// [`Diagnostics::global`] channel.
    pub fn new() -> Result<Self, RuntimeError> {
        RuntimeBuilder::new().build()
    }

    /// Shorthand for [`RuntimeBuilder::new`].
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub(crate) fn start(config: Config, diagnostics: Diagnostics) -> Result<Self, RuntimeError> {
        let scheduler = Scheduler::start(config, diagnostics)?;
        tracing::debug!(
            min_threads = scheduler.config().min_threads,
            max_threads = scheduler.config().max_threads,
            "runtime started"
        );
        Ok(Self { scheduler })
    }

    /// Submits `work` to the worker pool. See [`Scheduler::submit`].
    pub fn submit<T, F>(
        &self,
        work: F,
        cancellation: impl Into<Option<CancellationSignal>>,
    ) -> FutureHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&Cx) -> Result<T, StepError> + Send + 'static,
    {
        self.scheduler.submit(work, cancellation)
    }

    /// Submits promise-driven work. See [`Scheduler::submit_with`].
    pub fn submit_with<T, F>(
        &self,
        work: F,
        cancellation: impl Into<Option<CancellationSignal>>,
    ) -> FutureHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(Promise<T>) + Send + 'static,
    {
        self.scheduler.submit_with(work, cancellation)
    }

    /// Submits promise-driven work whose first step runs on `context`.
    pub fn submit_on<T, F>(
        &self,
        context: &AffinityContext,
        work: F,
        cancellation: impl Into<Option<CancellationSignal>>,
    ) -> FutureHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(Promise<T>) + Send + 'static,
    {
        self.scheduler.submit_on(context, work, cancellation)
    }

    /// A future resolved from outside.
    pub fn pending<T>(&self) -> FutureHandle<T>
    where
        T: Clone + Send + 'static,
    {
        self.scheduler.pending()
    }

    /// Runs `work` once on the worker pool, without a future to observe.
    ///
    /// A panic in `work` is caught and reported as
    /// [`DiagnosticKind::PayloadPanic`](crate::DiagnosticKind::PayloadPanic);
    /// the worker keeps running.
    pub fn spawn<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.spawn(work);
    }

    /// Queues `continuation` on `context`.
    ///
    /// # Arguments
    /// * `context` - [`AffinityContext::None`] targets the pool, an exclusive
    ///   context its owning thread in post order
    /// * `continuation` - The closure to run
    pub fn post<F>(&self, context: &AffinityContext, continuation: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.post(context, continuation);
    }

    /// Triggers `signal` after `delay`. Dropping the returned guard disarms it.
    pub fn cancel_after(&self, signal: &CancellationSignal, delay: Duration) -> CancelAfter {
        self.scheduler.cancel_after(signal, delay)
    }

    /// Starts a dedicated thread that runs its posts strictly in order.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::ThreadSpawn`] if the OS refuses the thread.
    pub fn exclusive_context(&self, name: impl Into<String>) -> Result<ExclusiveContext, RuntimeError> {
        self.scheduler.exclusive_context(name)
    }

    /// An untriggered signal reporting to this runtime's diagnostics.
    pub fn signal(&self) -> CancellationSignal {
        self.scheduler.signal()
    }

    /// Blocks until `future` resolves. See [`bridge::block_on`].
    pub fn block_on<T>(&self, future: &FutureHandle<T>) -> Result<Outcome<T>, RuntimeError>
    where
        T: Clone + Send + 'static,
    {
        bridge::block_on(future)
    }

    /// Like [`block_on`](Self::block_on), giving up after `timeout`.
    ///
    /// # Returns
    /// The outcome, or [`RuntimeError::Timeout`] with the future still pending.
    /// A timeout too large to express as a deadline waits without one.
    pub fn block_on_timeout<T>(
        &self,
        future: &FutureHandle<T>,
        timeout: Duration,
    ) -> Result<Outcome<T>, RuntimeError>
    where
        T: Clone + Send + 'static,
    {
        bridge::block_on_timeout(future, timeout)
    }

    /// A cloneable handle for code that must schedule without owning the runtime.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The channel this runtime reports panics and unobserved faults to.
    pub fn diagnostics(&self) -> &Diagnostics {
        self.scheduler.diagnostics()
    }

    /// The validated configuration the runtime started with.
    pub fn config(&self) -> &Config {
        self.scheduler.config()
    }

    /// Live pool workers, busy or idle.
    pub fn active_threads(&self) -> usize {
        self.scheduler.active_threads()
    }

    /// Pool workers currently parked waiting for work.
    pub fn idle_threads(&self) -> usize {
        self.scheduler.idle_threads()
    }

    /// Items queued for the pool and not yet picked up.
    pub fn queue_depth(&self) -> usize {
        self.scheduler.queue_depth()
    }

    /// Timers still armed, the pool's periodic growth check included.
    pub fn pending_timers(&self) -> usize {
        self.scheduler.pending_timers()
    }

    /// Stops the timer thread and the pool. Queued work is still run; later
    /// submissions are dropped with a warning.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
