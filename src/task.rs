//! Futures and their continuation graph.
//!
//! Every unit of work submitted to the runtime is a [`Task`]: a small state
//! machine guarded by its own lock, plus the list of waiters to notify when it
//! resolves. Callers hold a [`FutureHandle`] (read side, cloneable, resolvable from
//! outside); the running work holds a [`Promise`] (write side, able to suspend).
//!
//! # States
//!
//! ```text
//! Pending ─► Running ─► (Suspended ─► Running)* ─► Completed | Faulted | Cancelled
//! ```
//!
//! A terminal state never changes. Resolving a terminal future again is reported
//! as [`RuntimeError::InvalidStateTransition`] and has no effect.
//!
//! # Suspension
//!
//! ```ignore
//! let data = rt.pending::<Vec<u8>>();
//! let parsed = rt.submit_with(
//!     |promise: Promise<usize>| {
//!         let _ = promise.suspend_on(&data, |promise, outcome| {
//!             match outcome {
//!                 Outcome::Completed(bytes) => { let _ = promise.complete(bytes.len()); }
//!                 _ => { let _ = promise.cancel(); }
//!             }
//!         });
//!     },
//!     None,
//! );
//! ```
//!
//! While `parsed` waits on `data` no thread is held: the step returned, and the
//! resume closure sits in `data`'s waiter list until `data` resolves.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;

use parking_lot::Mutex;

use crate::cancel::{CancellationSignal, Cancelled};
use crate::diagnostics::DiagnosticKind;
use crate::error::{Fault, RuntimeError, StepError};
use crate::runtime::{AffinityContext, Scheduler};

thread_local! {
    /// Id of the task whose step is running on this thread (0 for none).
    static STEPPING: Cell<u64> = const { Cell::new(0) };
}

/// What an observer sees.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// Not resolved yet.
    Pending,
    /// Resolved with a value.
    Completed(T),
    /// Resolved with a fault: an error, a panic, or an abandoned promise.
    Faulted(Fault),
    /// Resolved by cancellation.
    Cancelled,
}

impl<T> Outcome<T> {
    /// Whether the future has not resolved yet.
    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }

    /// Whether the future has resolved, in any of the three ways.
    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }

    /// Whether the future completed with a value.
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    /// Whether the future faulted.
    pub fn is_faulted(&self) -> bool {
        matches!(self, Outcome::Faulted(_))
    }

    /// Whether the future was cancelled rather than completed or faulted.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// The value, if completed.
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// The fault, if faulted.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Outcome::Faulted(fault) => Some(fault),
            _ => None,
        }
    }
}

/// The explicit context a step runs with: its cancellation signal and the
/// affinity context it is running on.
#[derive(Debug, Clone)]
pub struct Cx {
    cancellation: CancellationSignal,
    context: AffinityContext,
}

impl Cx {
    pub(crate) fn new(cancellation: CancellationSignal, context: AffinityContext) -> Self {
        Self {
            cancellation,
            context,
        }
    }

    /// The signal this step was submitted with.
    ///
    /// A submission without one gets a fresh signal that no other code holds.
    pub fn cancellation(&self) -> &CancellationSignal {
        &self.cancellation
    }

    /// The affinity context this step runs on; suspensions capture it.
    pub fn context(&self) -> &AffinityContext {
        &self.context
    }

    /// Whether the step's signal has fired. See [`checkpoint`](Self::checkpoint).
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_triggered()
    }

    /// Cooperative cancellation point: `cx.checkpoint()?`.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        self.cancellation.check()
    }
}

enum State<T> {
    Pending,
    Running,
    Suspended {
        context: AffinityContext,
        cancellation: CancellationSignal,
    },
    Completed(T),
    Faulted(Fault),
    Cancelled,
}

impl<T: Clone> State<T> {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            State::Completed(_) | State::Faulted(_) | State::Cancelled
        )
    }

    fn name(&self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Running => "running",
            State::Suspended { .. } => "suspended",
            State::Completed(_) => "completed",
            State::Faulted(_) => "faulted",
            State::Cancelled => "cancelled",
        }
    }

    fn outcome(&self) -> Outcome<T> {
        match self {
            State::Pending | State::Running | State::Suspended { .. } => Outcome::Pending,
            State::Completed(value) => Outcome::Completed(value.clone()),
            State::Faulted(fault) => Outcome::Faulted(fault.clone()),
            State::Cancelled => Outcome::Cancelled,
        }
    }
}

type Resume<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

enum Waiter<T> {
    /// Scheduled onto `context` with the outcome once the task resolves.
    Continuation {
        resume: Resume<T>,
        context: AffinityContext,
        cancellation: CancellationSignal,
    },
    /// Woken inline; used by the bridge and by `.await`.
    Wake(Waker),
}

struct TaskInner<T> {
    state: State<T>,
    waiters: Vec<Waiter<T>>,
    /// Someone looked at (or waited on) this task.
    observed: bool,
    /// Where the next step will run.
    resume_context: AffinityContext,
}

/// Shared state of one future.
pub(crate) struct Task<T> {
    id: u64,
    scheduler: Scheduler,
    inner: Mutex<TaskInner<T>>,
}

impl<T> Task<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(id: u64, scheduler: Scheduler, context: AffinityContext) -> Arc<Self> {
        Arc::new(Self {
            id,
            scheduler,
            inner: Mutex::new(TaskInner {
                state: State::Pending,
                waiters: Vec::new(),
                observed: false,
                resume_context: context,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn observe(&self) -> Outcome<T> {
        let mut inner = self.inner.lock();
        inner.observed = true;
        inner.state.outcome()
    }

    fn is_terminal(&self) -> bool {
        self.inner.lock().state.is_terminal()
    }

    /// Moves a pending or suspended task to `Running` at the start of a step.
    fn begin_step(&self) {
        let mut inner = self.inner.lock();
        if let State::Suspended {
            context,
            cancellation,
        } = &inner.state
        {
            tracing::trace!(
                task = self.id,
                ?context,
                cancelled = cancellation.is_triggered(),
                "resuming suspended future"
            );
        }
        match inner.state {
            State::Pending | State::Suspended { .. } => inner.state = State::Running,
            State::Running => {}
            _ => tracing::trace!(
                task = self.id,
                state = inner.state.name(),
                "step runs after its future resolved"
            ),
        }
    }

    fn suspend(
        &self,
        context: AffinityContext,
        cancellation: CancellationSignal,
    ) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return Err(RuntimeError::InvalidStateTransition {
                id: self.id,
                state: inner.state.name(),
            });
        }
        inner.resume_context = context.clone();
        inner.state = State::Suspended {
            context,
            cancellation,
        };
        Ok(())
    }

    /// Moves to a terminal state exactly once and dispatches every waiter.
    fn resolve(self: &Arc<Self>, terminal: State<T>) -> Result<(), RuntimeError> {
        let (waiters, outcome, unobserved_fault) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return Err(RuntimeError::InvalidStateTransition {
                    id: self.id,
                    state: inner.state.name(),
                });
            }
            inner.state = terminal;
            let waiters = std::mem::take(&mut inner.waiters);
            let outcome = inner.state.outcome();
            let unobserved_fault = outcome.is_faulted() && !inner.observed;
            (waiters, outcome, unobserved_fault)
        };

        tracing::trace!(task = self.id, waiters = waiters.len(), "future resolved");
        self.dispatch(waiters, &outcome);

        if unobserved_fault {
            let task = self.clone();
            let grace = self.scheduler.config().unobserved_fault_grace;
            self.scheduler
                .after(grace, move || task.report_if_unobserved());
        }
        Ok(())
    }

    /// Hands the outcome to each waiter, in registration order.
    fn dispatch(&self, waiters: Vec<Waiter<T>>, outcome: &Outcome<T>) {
        for waiter in waiters {
            match waiter {
                Waiter::Continuation {
                    resume,
                    context,
                    cancellation,
                } => {
                    let outcome = outcome.clone();
                    self.scheduler
                        .schedule(Box::new(move || resume(outcome)), &context, &cancellation);
                }
                Waiter::Wake(waker) => waker.wake(),
            }
        }
    }

    fn add_continuation(
        &self,
        resume: Resume<T>,
        context: AffinityContext,
        cancellation: CancellationSignal,
    ) {
        let outcome = {
            let mut inner = self.inner.lock();
            inner.observed = true;
            if !inner.state.is_terminal() {
                inner.waiters.push(Waiter::Continuation {
                    resume,
                    context,
                    cancellation,
                });
                return;
            }
            inner.state.outcome()
        };

        // Already resolved: still scheduled, never run inline.
        self.dispatch(
            vec![Waiter::Continuation {
                resume,
                context,
                cancellation,
            }],
            &outcome,
        );
    }

    /// Returns the outcome if terminal, otherwise registers `waker`.
    pub(crate) fn poll_outcome(&self, waker: &Waker) -> Option<Outcome<T>> {
        let mut inner = self.inner.lock();
        inner.observed = true;
        if inner.state.is_terminal() {
            return Some(inner.state.outcome());
        }

        let registered = inner
            .waiters
            .iter()
            .any(|w| matches!(w, Waiter::Wake(existing) if existing.will_wake(waker)));
        if !registered {
            inner.waiters.push(Waiter::Wake(waker.clone()));
        }
        None
    }

    /// Fails fast when the calling thread owns the exclusive context this task
    /// resumes on.
    pub(crate) fn check_self_block(&self) -> Result<(), RuntimeError> {
        if !self.scheduler.config().deadlock_detection {
            return Ok(());
        }
        let context = {
            let inner = self.inner.lock();
            if inner.state.is_terminal() {
                // Nothing left to resume; the bridge returns at once.
                return Ok(());
            }
            inner.resume_context.clone()
        };
        match context.exclusive() {
            Some(ctx) => ctx.check_self_block(),
            None => Ok(()),
        }
    }

    fn report_if_unobserved(&self) {
        let fault = {
            let mut inner = self.inner.lock();
            if inner.observed {
                return;
            }
            inner.observed = true;
            match &inner.state {
                State::Faulted(fault) => fault.clone(),
                _ => return,
            }
        };

        self.scheduler.diagnostics().report(
            DiagnosticKind::UnobservedFault,
            format!("future #{} faulted and was never observed: {fault}", self.id),
        );
    }
}

impl<T> Task<T> {
    /// Drops a waker registered by [`poll_outcome`](Self::poll_outcome) whose
    /// owner stopped waiting.
    pub(crate) fn remove_waker(&self, waker: &Waker) {
        let removed = {
            let mut inner = self.inner.lock();
            let (removed, kept): (Vec<Waiter<T>>, Vec<Waiter<T>>) = std::mem::take(&mut inner.waiters)
                .into_iter()
                .partition(|w| matches!(w, Waiter::Wake(existing) if existing.will_wake(waker)));
            inner.waiters = kept;
            removed
        };
        drop(removed);
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

/// Runs one step of a task: marks it running, runs `step`, and turns a panic
/// into a fault on that task.
pub(crate) fn run_step<T, F>(promise: Promise<T>, step: F)
where
    T: Clone + Send + 'static,
    F: FnOnce(Promise<T>),
{
    let task = promise.task.clone();
    task.begin_step();

    let previous = STEPPING.replace(task.id);
    let result = panic::catch_unwind(AssertUnwindSafe(move || step(promise)));
    STEPPING.set(previous);

    if let Err(payload) = result {
        let fault = Fault::from_panic(payload);
        tracing::debug!(task = task.id, %fault, "work panicked");
        let _ = task.resolve(State::Faulted(fault));
    }
}

/// Read side of a future.
///
/// Cloneable. Besides observing, a handle can resolve the future from outside,
/// which is how futures created with [`Scheduler::pending`] are completed.
///
/// Awaiting a handle yields its terminal [`Outcome`].
pub struct FutureHandle<T> {
    task: Arc<Task<T>>,
    /// Waker left in the task by the last pending `poll`.
    waker: Option<Waker>,
}

impl<T> Clone for FutureHandle<T> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            waker: None,
        }
    }
}

impl<T> Drop for FutureHandle<T> {
    fn drop(&mut self) {
        if let Some(waker) = self.waker.take() {
            self.task.remove_waker(&waker);
        }
    }
}

impl<T> FutureHandle<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn from_task(task: Arc<Task<T>>) -> Self {
        Self { task, waker: None }
    }

    /// Process-unique id, as it appears in tracing events and diagnostics.
    pub fn id(&self) -> u64 {
        self.task.id
    }

    /// Non-blocking read of the current outcome.
    pub fn observe(&self) -> Outcome<T> {
        self.task.observe()
    }

    pub fn is_terminal(&self) -> bool {
        self.task.is_terminal()
    }

    /// Resolves the future with `value` from outside its work.
    ///
    /// # Arguments
    /// * `value` - The value every waiter receives
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidStateTransition`] if the future already resolved.
    ///
    /// # Example
    /// ```ignore
    /// let future = rt.pending::<u8>();
    /// future.complete(1)?;
    /// assert!(future.complete(2).is_err());
    /// ```
    pub fn complete(&self, value: T) -> Result<(), RuntimeError> {
        self.task.resolve(State::Completed(value))
    }

    /// Resolves the future with `fault`. Errors as [`complete`](Self::complete).
    pub fn fault(&self, fault: Fault) -> Result<(), RuntimeError> {
        self.task.resolve(State::Faulted(fault))
    }

    /// Resolves the future as cancelled. Errors as [`complete`](Self::complete).
    pub fn cancel(&self) -> Result<(), RuntimeError> {
        self.task.resolve(State::Cancelled)
    }

    /// Schedules `continuation` onto `context` with the outcome once this future
    /// resolves (right away if it already has).
    pub fn then<F>(&self, context: &AffinityContext, continuation: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.task.add_continuation(
            Box::new(continuation),
            context.clone(),
            self.task.scheduler.signal(),
        );
    }

    pub(crate) fn task(&self) -> &Arc<Task<T>> {
        &self.task
    }
}

impl<T> Future for FutureHandle<T>
where
    T: Clone + Send + 'static,
{
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = this.task.poll_outcome(cx.waker());

        // Polled with a different waker: the one registered earlier is stale.
        if let Some(previous) = this.waker.take()
            && (outcome.is_some() || !previous.will_wake(cx.waker()))
        {
            this.task.remove_waker(&previous);
        }

        match outcome {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                this.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> fmt::Debug for FutureHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureHandle")
            .field("id", &self.task.id)
            .finish()
    }
}

/// Write side of a future, owned by the step that is running it.
///
/// Dropping a promise without resolving it (and without suspending) faults the
/// future with [`Fault::Abandoned`].
pub struct Promise<T>
where
    T: Clone + Send + 'static,
{
    task: Arc<Task<T>>,
    cx: Cx,
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(task: Arc<Task<T>>, cx: Cx) -> Self {
        Self { task, cx }
    }

    /// The context of the step holding this promise.
    pub fn cx(&self) -> &Cx {
        &self.cx
    }

    /// A read handle to the future this promise resolves.
    pub fn handle(&self) -> FutureHandle<T> {
        FutureHandle::from_task(self.task.clone())
    }

    pub fn is_resolved(&self) -> bool {
        self.task.is_terminal()
    }

    /// Same as [`FutureHandle::complete`].
    pub fn complete(&self, value: T) -> Result<(), RuntimeError> {
        self.task.resolve(State::Completed(value))
    }

    pub fn fault(&self, fault: Fault) -> Result<(), RuntimeError> {
        self.task.resolve(State::Faulted(fault))
    }

    pub fn cancel(&self) -> Result<(), RuntimeError> {
        self.task.resolve(State::Cancelled)
    }

    /// Resolves from a work function's result.
    pub fn resolve(&self, result: Result<T, StepError>) -> Result<(), RuntimeError> {
        match result {
            Ok(value) => self.complete(value),
            Err(StepError::Cancelled) => self.cancel(),
            Err(StepError::Fault(fault)) => self.fault(fault),
        }
    }

    /// Suspends until `other` resolves, then runs `resume` with this promise
    /// and `other`'s outcome on the affinity context this step runs on.
    ///
    /// The calling step should return right after; no thread is held while
    /// suspended.
    pub fn suspend_on<U, F>(self, other: &FutureHandle<U>, resume: F) -> Result<(), RuntimeError>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Promise<T>, Outcome<U>) + Send + 'static,
    {
        let context = self.cx.context.clone();
        self.suspend_into(other, context, resume)
    }

    /// Like [`suspend_on`](Self::suspend_on) but resumes on the worker pool
    /// whatever context this step runs on.
    pub fn suspend_on_pool<U, F>(self, other: &FutureHandle<U>, resume: F) -> Result<(), RuntimeError>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Promise<T>, Outcome<U>) + Send + 'static,
    {
        self.suspend_into(other, AffinityContext::None, resume)
    }

    fn suspend_into<U, F>(
        mut self,
        other: &FutureHandle<U>,
        context: AffinityContext,
        resume: F,
    ) -> Result<(), RuntimeError>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Promise<T>, Outcome<U>) + Send + 'static,
    {
        let cancellation = self.cx.cancellation.clone();
        self.task.suspend(context.clone(), cancellation.clone())?;
        self.cx.context = context.clone();

        let promise = self;
        other.task.add_continuation(
            Box::new(move |outcome| run_step(promise, move |promise| resume(promise, outcome))),
            context,
            cancellation,
        );
        Ok(())
    }
}

impl<T> Drop for Promise<T>
where
    T: Clone + Send + 'static,
{
    fn drop(&mut self) {
        if self.task.is_terminal() {
            return;
        }
        let fault = if thread::panicking() {
            if STEPPING.get() == self.task.id {
                // `run_step` records the panic itself.
                return;
            }
            Fault::Panicked("promise dropped while its thread was panicking".to_string())
        } else {
            Fault::Abandoned
        };

        tracing::debug!(task = self.task.id, %fault, "promise dropped unresolved");
        let _ = self.task.resolve(State::Faulted(fault));
    }
}

impl<T> fmt::Debug for Promise<T>
where
    T: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.task.id)
            .field("cx", &self.cx)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::diagnostics::Diagnostics;
    use crate::runtime::waker::Latch;

    fn scheduler() -> Scheduler {
        let config = Config {
            min_threads: 1,
            max_threads: 1,
            deadlock_detection: true,
            ..Config::default()
        };
        Scheduler::start(config, Diagnostics::new()).unwrap()
    }

    #[test]
    fn dropping_an_awaiting_handle_unregisters_its_waker() {
        let scheduler = scheduler();
        let future = scheduler.pending::<u8>();
        let task = future.task().clone();

        let mut awaiting = future.clone();
        let latch = Latch::new();
        let waker = latch.waker();
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut awaiting).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut awaiting).poll(&mut cx).is_pending());
        assert_eq!(task.waiter_count(), 1);

        drop(awaiting);
        assert_eq!(task.waiter_count(), 0);
    }

    #[test]
    fn repolling_with_a_new_waker_replaces_the_old_one() {
        let scheduler = scheduler();
        let future = scheduler.pending::<u8>();
        let task = future.task().clone();
        let mut awaiting = future.clone();

        for _ in 0..10 {
            let latch = Latch::new();
            let waker = latch.waker();
            let mut cx = Context::from_waker(&waker);
            assert!(Pin::new(&mut awaiting).poll(&mut cx).is_pending());
        }
        assert_eq!(task.waiter_count(), 1);

        future.complete(2).unwrap();
        assert_eq!(task.waiter_count(), 0);
    }

    #[test]
    fn terminal_future_never_reports_self_block() {
        let scheduler = scheduler();
        let ctx = scheduler.exclusive_context("owner").unwrap();
        let context = AffinityContext::from(ctx.clone());
        let task = Task::<u8>::new(1, scheduler.clone(), context);

        let pending = task.clone();
        let blocked = ctx.send(move || pending.check_self_block().is_err()).unwrap();
        assert!(blocked);

        let _ = task.resolve(State::Completed(3));
        let resolved = task.clone();
        assert!(ctx.send(move || resolved.check_self_block().is_ok()).unwrap());
    }
}
