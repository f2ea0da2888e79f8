//! Fluent builder for [`Runtime`] construction.

use std::time::Duration;

use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::error::RuntimeError;
use crate::runtime::Runtime;

/// Builder for [`Runtime`] instances.
///
/// Starts from [`Config::default`]; each setter overrides one field. The
/// assembled config is validated in [`build`](Self::build).
///
/// # Example
/// ```ignore
/// let rt = RuntimeBuilder::new()
///     .min_threads(2)
///     .max_threads(16)
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    config: Config,
    diagnostics: Option<Diagnostics>,
}

impl RuntimeBuilder {
    /// Creates a builder holding [`Config::default`].
    ///
    /// # Example
    /// ```ignore
    /// let builder = RuntimeBuilder::new();
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration, e.g. one loaded from a file.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets how many workers start with the runtime and never retire.
    ///
    /// # Arguments
    /// * `threads` - Resident worker count; must be at least 1
    pub fn min_threads(mut self, threads: usize) -> Self {
        self.config.min_threads = threads;
        self
    }

    /// Sets the ceiling the pool may grow to under a sustained backlog.
    ///
    /// # Arguments
    /// * `threads` - Upper worker bound; must not be below `min_threads`
    pub fn max_threads(mut self, threads: usize) -> Self {
        self.config.max_threads = threads;
        self
    }

    /// Sets how long a worker above `min_threads` may sit idle before it exits.
    ///
    /// A timeout too large to express as a deadline keeps idle workers parked
    /// until work arrives.
    pub fn worker_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.worker_idle_timeout = timeout;
        self
    }

    /// Sets how long a backlog must persist before one more worker is added.
    pub fn growth_interval(mut self, interval: Duration) -> Self {
        self.config.growth_interval = interval;
        self
    }

    /// Sets the queue depth above which the backlog counts as sustained.
    pub fn queue_high_water_mark(mut self, depth: usize) -> Self {
        self.config.queue_high_water_mark = depth;
        self
    }

    /// Sets how long a fault may go unobserved before it is reported.
    ///
    /// # Arguments
    /// * `grace` - Delay after the fault; an unrepresentable delay never reports
    ///
    /// # Example
    /// ```ignore
    /// let rt = RuntimeBuilder::new()
    ///     .unobserved_fault_grace(Duration::from_millis(250))
    ///     .build()?;
    /// ```
    pub fn unobserved_fault_grace(mut self, grace: Duration) -> Self {
        self.config.unobserved_fault_grace = grace;
        self
    }

    /// Turns the self-block check of the bridge and of `send` on or off.
    pub fn deadlock_detection(mut self, enabled: bool) -> Self {
        self.config.deadlock_detection = enabled;
        self
    }

    /// Reports to `diagnostics` instead of the process-wide channel.
    pub fn diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Validates the configuration and starts the runtime's threads.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidConfig`] for an inconsistent configuration,
    /// [`RuntimeError::ThreadSpawn`] if the OS refuses a thread.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let diagnostics = self.diagnostics.unwrap_or_else(Diagnostics::global);
        Runtime::start(self.config, diagnostics)
    }
}
