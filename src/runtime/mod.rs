//! Runtime subsystem modules.

pub(crate) mod context;
mod core;
pub(crate) mod pool;
pub(crate) mod queue;
pub(crate) mod scheduler;
pub(crate) mod waker;

pub use context::{AffinityContext, ExclusiveContext};
pub use core::Runtime;
pub use scheduler::{GrowthPolicy, PoolLoad, Scheduler};
