//! Cooperative cancellation.
//!
//! A [`CancellationSignal`] is a write-once flag plus an ordered list of callbacks.
//! Triggering it never interrupts running code: it runs the callbacks and makes
//! [`CancellationSignal::is_triggered`] return `true`. Work that wants to stop early
//! has to look.
//!
//! ```ignore
//! let signal = CancellationSignal::new();
//! let handle = rt.submit(
//!     |cx| {
//!         for chunk in chunks {
//!             cx.checkpoint()?;
//!             process(chunk);
//!         }
//!         Ok(())
//!     },
//!     signal.clone(),
//! );
//! signal.trigger();
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::panic_message;

type Callback = Box<dyn FnOnce() + Send>;

/// Returned by [`CancellationSignal::check`] once the signal has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation was cancelled")]
pub struct Cancelled;

/// A shared, write-once cancellation flag.
///
/// Cloning shares the same flag. A fresh signal never fires unless somebody
/// calls [`trigger`](Self::trigger), so it doubles as the "not cancellable"
/// default.
#[derive(Clone)]
pub struct CancellationSignal {
    inner: Arc<Inner>,
}

struct Inner {
    triggered: AtomicBool,
    callbacks: Mutex<Callbacks>,
    diagnostics: Diagnostics,
    /// Registrations on parent signals, for a signal built by `linked`.
    links: Mutex<Vec<Registration>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for registration in self.links.get_mut().drain(..) {
            registration.dispose();
        }
    }
}

struct Callbacks {
    fired: bool,
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

impl CancellationSignal {
    /// Creates an untriggered signal that reports callback panics to the
    /// process-wide diagnostics sink.
    pub fn new() -> Self {
        Self::with_diagnostics(Diagnostics::global())
    }

    /// Creates an untriggered signal reporting to `diagnostics`.
    pub fn with_diagnostics(diagnostics: Diagnostics) -> Self {
        Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                callbacks: Mutex::new(Callbacks {
                    fired: false,
                    next_id: 0,
                    entries: Vec::new(),
                }),
                diagnostics,
                links: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a signal that fires as soon as any of `parents` fires.
    ///
    /// Parents only hold a weak reference to the child, so a linked signal
    /// nobody else holds is freed normally, and its callbacks on the parents
    /// are removed with it.
    pub fn linked(parents: &[&CancellationSignal]) -> Self {
        let child = Self::new();
        for parent in parents {
            let weak: Weak<Inner> = Arc::downgrade(&child.inner);
            let registration = parent.register(move || {
                if let Some(inner) = weak.upgrade() {
                    CancellationSignal { inner }.trigger();
                }
            });
            child.inner.links.lock().push(registration);
        }
        child
    }

    /// Callbacks registered and not yet run.
    pub fn registered(&self) -> usize {
        self.inner.callbacks.lock().entries.len()
    }

    /// Fires the signal.
    ///
    /// The first call runs every registered callback once, in registration order,
    /// on the calling thread. Later calls do nothing. A panicking callback is
    /// reported and the rest still run.
    pub fn trigger(&self) {
        let callbacks = {
            let mut state = self.inner.callbacks.lock();
            if state.fired {
                return;
            }
            state.fired = true;
            self.inner.triggered.store(true, Ordering::Release);
            std::mem::take(&mut state.entries)
        };

        tracing::trace!(callbacks = callbacks.len(), "cancellation triggered");

        for (id, callback) in callbacks {
            self.invoke(id, callback);
        }
    }

    /// Registers `callback` to run when the signal fires.
    ///
    /// If the signal already fired, the callback runs right here before this
    /// returns and the registration is inert.
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        let id = {
            let mut state = self.inner.callbacks.lock();
            if !state.fired {
                let id = state.next_id;
                state.next_id += 1;
                state.entries.push((id, Box::new(callback)));
                return Registration {
                    signal: Arc::downgrade(&self.inner),
                    id,
                };
            }
            state.next_id
        };

        self.invoke(id, Box::new(callback));
        Registration {
            signal: Weak::new(),
            id,
        }
    }

    /// Non-blocking read of the flag.
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once the signal has fired, for use with `?`.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_triggered() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Whether two handles share the same flag.
    pub fn same_as(&self, other: &CancellationSignal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn invoke(&self, id: u64, callback: Callback) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
            self.inner.diagnostics.report(
                DiagnosticKind::CancellationCallbackPanic,
                format!(
                    "cancellation callback #{id} panicked: {}",
                    panic_message(payload.as_ref())
                ),
            );
        }
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

/// Handle to one registered callback.
///
/// Dropping it does nothing; call [`dispose`](Self::dispose) to unregister.
#[derive(Debug)]
pub struct Registration {
    signal: Weak<Inner>,
    id: u64,
}

impl Registration {
    /// Removes the callback. No-op if it already ran or the signal already fired.
    pub fn dispose(self) {
        if let Some(inner) = self.signal.upgrade() {
            let removed = {
                let mut state = inner.callbacks.lock();
                state
                    .entries
                    .iter()
                    .position(|(id, _)| *id == self.id)
                    .map(|index| state.entries.remove(index))
            };
            // Dropped outside the lock; the closure may own other signals.
            drop(removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn check_reports_cancellation() {
        let signal = CancellationSignal::with_diagnostics(Diagnostics::new());
        assert_eq!(signal.check(), Ok(()));
        signal.trigger();
        assert_eq!(signal.check(), Err(Cancelled));
    }

    #[test]
    fn disposed_registration_never_runs() {
        let signal = CancellationSignal::with_diagnostics(Diagnostics::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let registration = signal.register(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        registration.dispose();
        signal.trigger();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clones_share_the_flag() {
        let signal = CancellationSignal::with_diagnostics(Diagnostics::new());
        let clone = signal.clone();
        clone.trigger();
        assert!(signal.is_triggered());
        assert!(signal.same_as(&clone));
    }
}
