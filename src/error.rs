//! Error types for the runtime.
//!
//! Two families live here:
//!
//! - [`RuntimeError`]: misuse of the runtime itself (resolving a future twice,
//!   blocking an exclusive context on its own thread, bad configuration).
//! - [`Fault`] / [`StepError`]: failures of the *work* a future runs. These never
//!   escape a worker thread; they are captured into the future's terminal state and
//!   handed back through `observe`, `block_on` or a waiter.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::cancel::Cancelled;

/// Errors raised by runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A terminal future was asked to resolve again.
    #[error("future #{id} is already {state}; it cannot be resolved again")]
    InvalidStateTransition { id: u64, state: &'static str },

    /// The calling thread owns the exclusive context it is about to block on.
    #[error("blocking on exclusive context `{context}` from its owning thread would deadlock")]
    SelfBlockDeadlock { context: String },

    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(String),

    /// A bounded wait elapsed before the future resolved.
    #[error("future did not resolve within {0:?}")]
    Timeout(Duration),

    /// The target pool or context no longer accepts work.
    #[error("runtime is shut down")]
    Shutdown,

    #[error("failed to spawn runtime thread: {0}")]
    ThreadSpawn(#[from] io::Error),
}

/// The error carried by a `Faulted` future.
///
/// Cloneable so the same fault can be observed by every waiter, every
/// `observe` call and the bridge.
#[derive(Clone, Error)]
pub enum Fault {
    /// The work function returned an error.
    #[error("{0}")]
    Failed(Arc<dyn StdError + Send + Sync>),

    /// The work function (or one of its continuations) panicked.
    #[error("work panicked: {0}")]
    Panicked(String),

    /// The write side of the future was dropped without resolving it.
    #[error("future was abandoned before it resolved")]
    Abandoned,
}

impl Fault {
    /// Wraps any error (or string) as a [`Fault::Failed`].
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Fault::Failed(Arc::from(error.into()))
    }

    /// Builds a fault from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        Fault::Panicked(panic_message(payload.as_ref()))
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Failed(e) => f.debug_tuple("Failed").field(&e.to_string()).finish(),
            Fault::Panicked(msg) => f.debug_tuple("Panicked").field(msg).finish(),
            Fault::Abandoned => f.write_str("Abandoned"),
        }
    }
}

/// Early exit from a work function.
///
/// `Cancelled` turns the future `Cancelled`; `Fault` turns it `Faulted`.
/// `cx.checkpoint()?` converts through `From<Cancelled>`.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Fault(#[from] Fault),
}

impl StepError {
    /// Shorthand for `StepError::Fault(Fault::new(error))`.
    pub fn fail<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        StepError::Fault(Fault::new(error))
    }
}

impl From<Cancelled> for StepError {
    fn from(_: Cancelled) -> Self {
        StepError::Cancelled
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
