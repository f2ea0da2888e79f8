//! Cooperative task runtime with explicit cancellation and affinity contexts.
//!
//! Work is submitted to a growable worker pool and observed through futures.
//! A future that waits on another future suspends: its resume closure is parked
//! in the other future's waiter list and no thread is held. When it resolves,
//! the continuation is scheduled back onto the affinity context captured at the
//! suspension point, either any pool worker or the one dedicated thread of an
//! [`ExclusiveContext`].
//!
//! # Architecture
//!
//! - **Runtime**: owns the scheduler; entry point for submitting work
//! - **Scheduler**: routes continuations to the pool or to an exclusive context
//!   and decides when the pool grows
//! - **WorkerPool**: `min..=max` threads draining one FIFO queue
//! - **ExclusiveContext**: a dedicated thread with its own FIFO
//! - **FutureHandle / Promise**: read and write sides of a future
//! - **CancellationSignal**: one-shot cooperative cancellation with callbacks
//! - **block_on**: the synchronous bridge, with self-block detection
//! - **Diagnostics**: structured channel for faults nobody observed and panics
//!   the runtime contained
//!
//! # Example
//! ```ignore
//! use cadence::{Runtime, Outcome};
//!
//! let rt = Runtime::new()?;
//! let answer = rt.submit(|cx| {
//!     cx.checkpoint()?;
//!     Ok(6 * 7)
//! }, None);
//! assert!(matches!(rt.block_on(&answer)?, Outcome::Completed(42)));
//! ```

mod bridge;
mod builder;
mod cancel;
mod config;
mod diagnostics;
mod error;
mod runtime;
mod task;
mod timer;

pub use bridge::{block_on, block_on_timeout};
pub use builder::RuntimeBuilder;
pub use cancel::{CancellationSignal, Cancelled, Registration};
pub use config::Config;
pub use diagnostics::{DiagnosticKind, DiagnosticRecord, Diagnostics};
pub use error::{Fault, RuntimeError, StepError};
pub use runtime::{AffinityContext, ExclusiveContext, GrowthPolicy, PoolLoad, Runtime, Scheduler};
pub use task::{Cx, FutureHandle, Outcome, Promise};
pub use timer::CancelAfter;
