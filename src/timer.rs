//! Shared timer service.
//!
//! One background thread per runtime owns a [`TimerDriver`]: a list of
//! `(deadline, id, action)` entries. The thread sleeps on a condition variable
//! until the earliest deadline (or until a new, earlier timer is registered),
//! then runs every expired action outside the lock.
//!
//! Used for [`cancel_after`](crate::Runtime::cancel_after), for the unobserved
//! fault grace period, and for the pool's periodic growth check.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cancel::CancellationSignal;
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::{RuntimeError, panic_message};

type Action = Box<dyn FnOnce() + Send>;

struct Timer {
    /// `None` for a delay past the end of representable time: never fires.
    deadline: Option<Instant>,
    id: u64,
    action: Action,
}

/// Registered timers, kept unsorted; the list is short-lived and small.
struct TimerDriver {
    timers: Vec<Timer>,
    next_id: u64,
    shutdown: bool,
}

impl TimerDriver {
    fn new() -> Self {
        Self {
            timers: Vec::new(),
            next_id: 1,
            shutdown: false,
        }
    }

    fn register(&mut self, deadline: Option<Instant>, action: Action) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.timers.push(Timer {
            deadline,
            id,
            action,
        });
        id
    }

    fn cancel(&mut self, id: u64) -> Option<Action> {
        let index = self.timers.iter().position(|t| t.id == id)?;
        Some(self.timers.swap_remove(index).action)
    }

    /// Removes and returns every timer whose deadline has passed, earliest first.
    fn take_expired(&mut self, now: Instant) -> Vec<Timer> {
        let mut expired = Vec::new();
        let mut i = 0;
        while i < self.timers.len() {
            if self.timers[i].deadline.is_some_and(|deadline| deadline <= now) {
                expired.push(self.timers.swap_remove(i));
            } else {
                i += 1;
            }
        }
        expired.sort_by_key(|t| (t.deadline, t.id));
        expired
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().filter_map(|t| t.deadline).min()
    }
}

struct Shared {
    driver: Mutex<TimerDriver>,
    changed: Condvar,
    diagnostics: Diagnostics,
}

/// The runtime's single timer thread.
pub(crate) struct TimerService {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl TimerService {
    pub(crate) fn start(diagnostics: Diagnostics) -> Result<Self, RuntimeError> {
        let shared = Arc::new(Shared {
            driver: Mutex::new(TimerDriver::new()),
            changed: Condvar::new(),
            diagnostics,
        });

        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("cadence-timer".into())
            .spawn(move || run(worker))?;
        let thread_id = handle.thread().id();

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    /// Runs `action` on the timer thread once `delay` has elapsed.
    ///
    /// A delay too large to express as an `Instant` is kept (and counted by
    /// [`pending`](Self::pending)) but never fires.
    pub(crate) fn schedule<F>(&self, delay: Duration, action: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now().checked_add(delay);
        let id = {
            let mut driver = self.shared.driver.lock();
            if driver.shutdown {
                tracing::debug!("timer service is shut down; dropping timer");
                return TimerHandle {
                    shared: Weak::new(),
                    id: 0,
                };
            }
            driver.register(deadline, Box::new(action))
        };
        self.shared.changed.notify_one();

        TimerHandle {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.shared.driver.lock().timers.len()
    }

    /// Stops the timer thread. Pending timers are dropped without running.
    pub(crate) fn shutdown(&self) {
        let dropped = {
            let mut driver = self.shared.driver.lock();
            driver.shutdown = true;
            std::mem::take(&mut driver.timers)
        };
        self.shared.changed.notify_all();
        drop(dropped);

        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<Shared>) {
    tracing::debug!("timer thread started");
    let mut driver = shared.driver.lock();

    loop {
        if driver.shutdown {
            break;
        }

        let expired = driver.take_expired(Instant::now());
        if !expired.is_empty() {
            MutexGuard::unlocked(&mut driver, || {
                for timer in expired {
                    fire(&shared.diagnostics, timer);
                }
            });
            continue;
        }

        match driver.next_deadline() {
            Some(deadline) => {
                shared.changed.wait_until(&mut driver, deadline);
            }
            None => shared.changed.wait(&mut driver),
        }
    }

    tracing::debug!("timer thread stopped");
}

fn fire(diagnostics: &Diagnostics, timer: Timer) {
    let id = timer.id;
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(timer.action)) {
        diagnostics.report(
            DiagnosticKind::PayloadPanic,
            format!(
                "timer #{id} action panicked: {}",
                panic_message(payload.as_ref())
            ),
        );
    }
}

/// Handle to a pending timer.
pub(crate) struct TimerHandle {
    shared: Weak<Shared>,
    id: u64,
}

impl TimerHandle {
    /// Cancels the timer. Returns `true` if it had not fired yet.
    pub(crate) fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let action = shared.driver.lock().cancel(self.id);
        action.is_some()
    }
}

/// Triggers a [`CancellationSignal`] after a delay.
///
/// Returned by [`Runtime::cancel_after`](crate::Runtime::cancel_after).
/// Dropping or [`dispose`](Self::dispose)-ing the guard before the delay elapses
/// cancels the pending trigger.
#[must_use = "dropping the guard cancels the pending trigger"]
pub struct CancelAfter {
    timer: TimerHandle,
    signal: CancellationSignal,
}

impl CancelAfter {
    pub(crate) fn new(timers: &TimerService, signal: &CancellationSignal, delay: Duration) -> Self {
        let target = signal.clone();
        let timer = timers.schedule(delay, move || target.trigger());
        Self {
            timer,
            signal: signal.clone(),
        }
    }

    /// The signal this guard will trigger.
    pub fn signal(&self) -> &CancellationSignal {
        &self.signal
    }

    /// Cancels the pending trigger. Returns `true` if it had not fired yet.
    pub fn dispose(self) -> bool {
        self.timer.cancel()
    }
}

impl Drop for CancelAfter {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn driver_takes_only_expired_timers_in_deadline_order() {
        let mut driver = TimerDriver::new();
        let now = Instant::now();
        driver.register(Some(now + Duration::from_millis(20)), Box::new(|| {}));
        let late = driver.register(Some(now + Duration::from_secs(60)), Box::new(|| {}));
        driver.register(Some(now + Duration::from_millis(10)), Box::new(|| {}));

        let expired = driver.take_expired(now + Duration::from_millis(30));
        let deadlines: Vec<_> = expired.iter().map(|t| t.deadline).collect();

        assert_eq!(expired.len(), 2);
        assert!(deadlines[0] < deadlines[1]);
        assert_eq!(driver.timers.len(), 1);
        assert_eq!(driver.timers[0].id, late);
        assert_eq!(driver.next_deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn service_fires_and_cancels() {
        let service = TimerService::start(Diagnostics::new()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let _fired = service.schedule(Duration::from_millis(5), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let h = hits.clone();
        let cancelled = service.schedule(Duration::from_millis(5), move || {
            h.fetch_add(100, Ordering::SeqCst);
        });
        assert!(cancelled.cancel());

        thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(service.pending(), 0);
    }

    #[test]
    fn panicking_action_is_reported() {
        let diagnostics = Diagnostics::new();
        let service = TimerService::start(diagnostics.clone()).unwrap();
        let _timer = service.schedule(Duration::from_millis(1), || panic!("tick"));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(diagnostics.count(DiagnosticKind::PayloadPanic), 1);
    }

    #[test]
    fn unrepresentable_delay_never_fires_but_can_be_cancelled() {
        let service = TimerService::start(Diagnostics::new()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let forever = service.schedule(Duration::MAX, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let h = hits.clone();
        let _soon = service.schedule(Duration::from_millis(1), move || {
            h.fetch_add(10, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(service.pending(), 1);
        assert!(forever.cancel());
        assert_eq!(service.pending(), 0);
    }

    #[test]
    fn driver_ignores_undated_timers() {
        let mut driver = TimerDriver::new();
        let now = Instant::now();
        driver.register(None, Box::new(|| {}));

        assert!(driver.take_expired(now + Duration::from_secs(3600)).is_empty());
        assert_eq!(driver.next_deadline(), None);
    }
}
