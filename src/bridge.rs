//! The synchronous bridge.
//!
//! [`block_on`] is the one sanctioned way to turn a runtime future into a plain
//! return value, and the only operation in the crate that parks a thread waiting
//! on runtime state. Every sync-over-async deadlock therefore starts at a
//! `block_on` call site.
//!
//! The classic one: blocking the owning thread of an exclusive context on a
//! future that needs to resume on that same context. The thread waits for a
//! continuation only it can run. With deadlock detection on (the default in
//! debug builds) the bridge checks thread identity first and returns
//! [`RuntimeError::SelfBlockDeadlock`] instead of hanging.

use std::time::{Duration, Instant};

use crate::error::RuntimeError;
use crate::runtime::waker::Latch;
use crate::task::{FutureHandle, Outcome};

/// Blocks the calling thread until `future` resolves and returns its terminal
/// outcome. A fault is returned as [`Outcome::Faulted`], never swallowed.
///
/// # Errors
///
/// [`RuntimeError::SelfBlockDeadlock`] when called from the owning thread of
/// the exclusive context `future` resumes on (with deadlock detection on).
pub fn block_on<T>(future: &FutureHandle<T>) -> Result<Outcome<T>, RuntimeError>
where
    T: Clone + Send + 'static,
{
    wait(future, None)
}

/// Like [`block_on`], giving up after `timeout`.
///
/// # Errors
///
/// [`RuntimeError::Timeout`] if the future is still unresolved when `timeout`
/// elapses, plus everything [`block_on`] returns.
pub fn block_on_timeout<T>(
    future: &FutureHandle<T>,
    timeout: Duration,
) -> Result<Outcome<T>, RuntimeError>
where
    T: Clone + Send + 'static,
{
    wait(future, Some(timeout))
}

fn wait<T>(future: &FutureHandle<T>, timeout: Option<Duration>) -> Result<Outcome<T>, RuntimeError>
where
    T: Clone + Send + 'static,
{
    let task = future.task();
    task.check_self_block()?;

    // A timeout past the end of representable time waits without a deadline.
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    let latch = Latch::new();
    let waker = latch.waker();

    loop {
        if let Some(outcome) = task.poll_outcome(&waker) {
            return Ok(outcome);
        }
        if !latch.wait(deadline) {
            // One last look: the future may have resolved right at the deadline.
            if let Some(outcome) = task.poll_outcome(&waker) {
                return Ok(outcome);
            }
            task.remove_waker(&waker);
            return Err(RuntimeError::Timeout(timeout.unwrap_or_default()));
        }
    }
}
