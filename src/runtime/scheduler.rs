//! The scheduler decides where every continuation runs.
//!
//! - [`AffinityContext::None`] → the worker pool.
//! - [`AffinityContext::Exclusive`] → that context's owning thread.
//!
//! Scheduling never blocks. The scheduler also owns pool growth: a
//! [`GrowthPolicy`] consulted on every enqueue that finds no idle worker, and on a
//! periodic check driven by the timer service, so a pool whose workers are all
//! blocked still grows.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cancel::CancellationSignal;
use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::error::{RuntimeError, StepError};
use crate::runtime::context::{AffinityContext, ExclusiveContext};
use crate::runtime::pool::WorkerPool;
use crate::runtime::queue::{Job, ScheduledItem};
use crate::task::{Cx, FutureHandle, Promise, Task, run_step};
use crate::timer::{CancelAfter, TimerService};

/// Pool load as seen by the growth policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLoad {
    /// Items waiting in the queue.
    pub depth: usize,
    /// Live worker threads.
    pub active: usize,
    /// Workers parked waiting for work.
    pub idle: usize,
    /// No item was dequeued since the previous observation while items waited.
    pub stalled: bool,
}

/// Rate-limited pool growth.
///
/// A worker is added only when the backlog has been *sustained*: the queue was
/// over the high-water mark (or stalled with no idle worker) on observations at
/// least `interval` apart, and the previous growth was at least `interval` ago. A
/// burst that drains before then never adds a thread.
///
/// Pure bookkeeping over the `now` it is given, so tests drive it with synthetic
/// instants.
#[derive(Debug, Clone)]
pub struct GrowthPolicy {
    high_water_mark: usize,
    interval: Duration,
    max_threads: usize,
    backlog_since: Option<Instant>,
    last_growth: Option<Instant>,
}

impl GrowthPolicy {
    /// Creates a policy with no backlog recorded.
    ///
    /// # Arguments
    /// * `high_water_mark` - Depth above which a backlog counts without a stall
    /// * `interval` - How long a backlog must last, and the minimum gap between growths
    /// * `max_threads` - Never grow past this many workers
    pub fn new(high_water_mark: usize, interval: Duration, max_threads: usize) -> Self {
        Self {
            high_water_mark,
            interval,
            max_threads,
            backlog_since: None,
            last_growth: None,
        }
    }

    /// Returns `true` if one worker should be added now.
    pub fn decide(&mut self, now: Instant, load: PoolLoad) -> bool {
        let backlogged =
            load.idle == 0 && load.depth > 0 && (load.depth > self.high_water_mark || load.stalled);

        if !backlogged {
            self.backlog_since = None;
            return false;
        }
        if load.active >= self.max_threads {
            return false;
        }

        let since = *self.backlog_since.get_or_insert(now);
        if now.saturating_duration_since(since) < self.interval {
            return false;
        }
        if let Some(last) = self.last_growth
            && now.saturating_duration_since(last) < self.interval
        {
            return false;
        }

        self.last_growth = Some(now);
        true
    }
}

/// Cheap, cloneable handle to the runtime's scheduling machinery.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    pool: WorkerPool,
    timers: TimerService,
    growth: Mutex<GrowthState>,
    diagnostics: Diagnostics,
    config: Config,
    next_task_id: AtomicU64,
}

struct GrowthState {
    policy: GrowthPolicy,
    last_dequeued: u64,
    /// Verdict of the latest check, reused by enqueue-time observations.
    stalled: bool,
}

impl Scheduler {
    pub(crate) fn start(config: Config, diagnostics: Diagnostics) -> Result<Self, RuntimeError> {
        config.validate()?;

        let pool = WorkerPool::new(
            config.min_threads,
            config.max_threads,
            config.worker_idle_timeout,
            diagnostics.clone(),
        )?;
        let timers = TimerService::start(diagnostics.clone())?;
        let policy = GrowthPolicy::new(
            config.queue_high_water_mark,
            config.growth_interval,
            config.max_threads,
        );

        let scheduler = Self {
            inner: Arc::new(SchedulerInner {
                pool,
                timers,
                growth: Mutex::new(GrowthState {
                    policy,
                    last_dequeued: 0,
                    stalled: false,
                }),
                diagnostics,
                config,
                next_task_id: AtomicU64::new(1),
            }),
        };

        arm_growth_check(Arc::downgrade(&scheduler.inner), scheduler.inner.config.growth_interval);
        Ok(scheduler)
    }

    /// Runs `continuation` on the target context. Never blocks.
    ///
    /// A continuation whose signal already fired is still run; it is up to the
    /// continuation to look.
    pub(crate) fn schedule(
        &self,
        continuation: Job,
        context: &AffinityContext,
        cancellation: &CancellationSignal,
    ) {
        let item = ScheduledItem::new(context.target(), continuation, Some(cancellation.clone()));
        match context {
            AffinityContext::None => self.enqueue(item),
            AffinityContext::Exclusive(ctx) => {
                // A rejected item is dropped by the context after logging.
                let _ = ctx.enqueue(item);
            }
        }
    }

    fn enqueue(&self, item: ScheduledItem) {
        match self.inner.pool.enqueue(item) {
            Ok(pushed) if pushed.idle == 0 => {
                let load = PoolLoad {
                    depth: pushed.depth,
                    active: self.inner.pool.active_threads(),
                    idle: 0,
                    stalled: self.inner.growth.lock().stalled,
                };
                self.inner.maybe_grow(load);
            }
            Ok(_) => {}
            Err(item) => {
                tracing::warn!(destination = %item.target, "worker pool is shut down; dropping item");
                drop(item);
            }
        }
    }

    /// Posts a plain closure to `context`.
    pub fn post<F>(&self, context: &AffinityContext, continuation: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let signal = self.signal();
        self.schedule(Box::new(continuation), context, &signal);
    }

    /// Fire-and-forget work on the pool. A panic is reported on the diagnostics
    /// channel.
    pub fn spawn<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(&AffinityContext::None, work);
    }

    /// Submits `work` to the pool and returns its future immediately.
    ///
    /// `Ok(v)` completes the future, `Err(StepError::Cancelled)` cancels it and
    /// `Err(StepError::Fault(_))` or a panic faults it. Without a signal the work
    /// gets one that never fires.
    pub fn submit<T, F>(
        &self,
        work: F,
        cancellation: impl Into<Option<CancellationSignal>>,
    ) -> FutureHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&Cx) -> Result<T, StepError> + Send + 'static,
    {
        self.submit_with(
            move |promise: Promise<T>| {
                let result = work(promise.cx());
                if let Err(error) = promise.resolve(result) {
                    tracing::debug!(%error, "work finished after its future was resolved");
                }
            },
            cancellation,
        )
    }

    /// Submits work that resolves its future through a [`Promise`].
    ///
    /// The work may resolve right away, later from another thread, or suspend on
    /// another future with [`Promise::suspend_on`].
    pub fn submit_with<T, F>(
        &self,
        work: F,
        cancellation: impl Into<Option<CancellationSignal>>,
    ) -> FutureHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(Promise<T>) + Send + 'static,
    {
        self.submit_on(&AffinityContext::None, work, cancellation)
    }

    /// Like [`submit_with`](Self::submit_with), but the first step runs on
    /// `context`; later suspensions capture it.
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
        let cancellation = cancellation.into().unwrap_or_else(|| self.signal());
        let task = Task::new(self.next_task_id(), self.clone(), context.clone());
        let promise = Promise::new(task.clone(), Cx::new(cancellation.clone(), context.clone()));

        tracing::trace!(task = task.id(), ?context, "submitting work");
        self.schedule(Box::new(move || run_step(promise, work)), context, &cancellation);
        FutureHandle::from_task(task)
    }

    /// A future with no work attached, resolved from outside through
    /// [`FutureHandle::complete`], [`fault`](FutureHandle::fault) or
    /// [`cancel`](FutureHandle::cancel).
    pub fn pending<T>(&self) -> FutureHandle<T>
    where
        T: Clone + Send + 'static,
    {
        FutureHandle::from_task(Task::new(
            self.next_task_id(),
            self.clone(),
            AffinityContext::None,
        ))
    }

    /// Triggers `signal` after `delay` on the shared timer thread.
    pub fn cancel_after(&self, signal: &CancellationSignal, delay: Duration) -> CancelAfter {
        CancelAfter::new(&self.inner.timers, signal, delay)
    }

    /// Starts a new exclusive context reporting to this runtime's diagnostics.
    pub fn exclusive_context(&self, name: impl Into<String>) -> Result<ExclusiveContext, RuntimeError> {
        ExclusiveContext::new(
            name,
            self.inner.diagnostics.clone(),
            self.inner.config.deadlock_detection,
        )
    }

    /// An untriggered signal reporting to this runtime's diagnostics.
    pub fn signal(&self) -> CancellationSignal {
        CancellationSignal::with_diagnostics(self.inner.diagnostics.clone())
    }

    /// The runtime's diagnostics channel.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.inner.diagnostics
    }

    /// The validated configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// See [`Runtime::active_threads`](crate::Runtime::active_threads).
    pub fn active_threads(&self) -> usize {
        self.inner.pool.active_threads()
    }

    /// See [`Runtime::idle_threads`](crate::Runtime::idle_threads).
    pub fn idle_threads(&self) -> usize {
        self.inner.pool.idle_threads()
    }

    /// See [`Runtime::queue_depth`](crate::Runtime::queue_depth).
    pub fn queue_depth(&self) -> usize {
        self.inner.pool.queue_depth()
    }

    pub(crate) fn pending_timers(&self) -> usize {
        self.inner.timers.pending()
    }

    /// Runs `action` on the timer thread after `delay`.
    pub(crate) fn after<F>(&self, delay: Duration, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Fire-and-forget: never cancelled.
        let _timer = self.inner.timers.schedule(delay, action);
    }

    pub(crate) fn shutdown(&self) {
        tracing::debug!("scheduler shutting down");
        self.inner.timers.shutdown();
        self.inner.pool.shutdown();
    }

    fn next_task_id(&self) -> u64 {
        self.inner.next_task_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl SchedulerInner {
    fn maybe_grow(&self, load: PoolLoad) {
        let grow = self.growth.lock().policy.decide(Instant::now(), load);
        if !grow {
            return;
        }

        match self.pool.spawn_worker() {
            Ok(true) => tracing::debug!(
                depth = load.depth,
                active = load.active + 1,
                max = self.pool.max_threads(),
                "pool grew under sustained backlog"
            ),
            Ok(false) => {}
            Err(error) => tracing::error!(%error, "failed to grow worker pool"),
        }
    }

    /// Periodic observation that catches a pool whose workers are all blocked.
    fn check_growth(&self) {
        let dequeued = self.pool.dequeued();
        let depth = self.pool.queue_depth();
        let stalled = {
            let mut growth = self.growth.lock();
            let stalled = depth > 0 && dequeued == growth.last_dequeued;
            growth.last_dequeued = dequeued;
            growth.stalled = stalled;
            stalled
        };

        self.maybe_grow(PoolLoad {
            depth,
            active: self.pool.active_threads(),
            idle: self.pool.idle_threads(),
            stalled,
        });
    }
}

fn arm_growth_check(scheduler: Weak<SchedulerInner>, interval: Duration) {
    let Some(inner) = scheduler.upgrade() else {
        return;
    };
    let weak = scheduler.clone();
    let _timer = inner.timers.schedule(interval, move || {
        if let Some(inner) = weak.upgrade() {
            inner.check_growth();
            drop(inner);
            arm_growth_check(weak, interval);
        }
    });
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("active_threads", &self.active_threads())
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(depth: usize, active: usize, idle: usize) -> PoolLoad {
        PoolLoad {
            depth,
            active,
            idle,
            stalled: false,
        }
    }

    #[test]
    fn single_burst_does_not_grow() {
        let mut policy = GrowthPolicy::new(4, Duration::from_millis(100), 8);
        let t0 = Instant::now();

        assert!(!policy.decide(t0, load(50, 2, 0)));
        assert!(!policy.decide(t0 + Duration::from_millis(10), load(50, 2, 0)));
        // Drained before the interval elapsed: the backlog resets.
        assert!(!policy.decide(t0 + Duration::from_millis(20), load(0, 2, 0)));
        assert!(!policy.decide(t0 + Duration::from_millis(150), load(50, 2, 0)));
    }

    #[test]
    fn sustained_backlog_grows_once_per_interval() {
        let mut policy = GrowthPolicy::new(4, Duration::from_millis(100), 8);
        let t0 = Instant::now();

        assert!(!policy.decide(t0, load(10, 2, 0)));
        assert!(policy.decide(t0 + Duration::from_millis(100), load(10, 2, 0)));
        assert!(!policy.decide(t0 + Duration::from_millis(150), load(10, 3, 0)));
        assert!(policy.decide(t0 + Duration::from_millis(200), load(10, 3, 0)));
    }

    #[test]
    fn never_grows_past_max_or_with_idle_workers() {
        let mut policy = GrowthPolicy::new(4, Duration::from_millis(10), 3);
        let t0 = Instant::now();

        assert!(!policy.decide(t0, load(10, 3, 0)));
        assert!(!policy.decide(t0 + Duration::from_secs(1), load(10, 3, 0)));
        assert!(!policy.decide(t0 + Duration::from_secs(2), load(10, 2, 1)));
    }

    #[test]
    fn stalled_queue_below_high_water_mark_still_grows() {
        let mut policy = GrowthPolicy::new(100, Duration::from_millis(50), 4);
        let t0 = Instant::now();
        let stalled = PoolLoad {
            depth: 1,
            active: 1,
            idle: 0,
            stalled: true,
        };

        assert!(!policy.decide(t0, load(1, 1, 0)));
        assert!(!policy.decide(t0, stalled));
        assert!(policy.decide(t0 + Duration::from_millis(50), stalled));
    }
}
