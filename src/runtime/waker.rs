//! Thread-parking waker used by the synchronous bridge.
//!
//! A [`Latch`] is a flag plus a condition variable. Turned into a [`Waker`] it
//! can sit in a future's waiter list like any `.await`er; waking it sets the
//! flag and unparks the thread blocked in [`Latch::wait`].

use std::sync::Arc;
use std::task::Waker;
use std::time::Instant;

use futures::task::{self, ArcWake};
use parking_lot::{Condvar, Mutex};

pub(crate) struct Latch {
    notified: Mutex<bool>,
    wakeup: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            notified: Mutex::new(false),
            wakeup: Condvar::new(),
        })
    }

    pub(crate) fn waker(self: &Arc<Self>) -> Waker {
        task::waker(self.clone())
    }

    /// Parks until woken or until `deadline`. Returns `false` on timeout.
    ///
    /// Consumes the notification, so the latch can be waited on again.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut notified = self.notified.lock();
        while !*notified {
            match deadline {
                Some(deadline) => {
                    if self.wakeup.wait_until(&mut notified, deadline).timed_out() {
                        break;
                    }
                }
                None => self.wakeup.wait(&mut notified),
            }
        }

        let woken = *notified;
        *notified = false;
        woken
    }
}

impl ArcWake for Latch {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        *arc_self.notified.lock() = true;
        arc_self.wakeup.notify_all();
    }
}
