//! Runtime configuration.
//!
//! Loading is left to the embedding application; [`Config`] only derives
//! `serde` so it can be read from whatever format that application uses.
//! Durations are written as integer milliseconds:
//!
//! ```toml
//! min_threads = 2
//! max_threads = 32
//! worker_idle_timeout_ms = 10000
//! growth_interval_ms = 500
//! queue_high_water_mark = 64
//! ```

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Workers kept alive even when idle. At least 1.
    pub min_threads: usize,

    /// Hard cap on worker threads.
    pub max_threads: usize,

    /// How long a worker above `min_threads` may sit idle before it exits.
    #[serde(rename = "worker_idle_timeout_ms", with = "millis")]
    pub worker_idle_timeout: Duration,

    /// Minimum time between two growth steps, and the check period.
    #[serde(rename = "growth_interval_ms", with = "millis")]
    pub growth_interval: Duration,

    /// Queue depth above which the backlog counts toward growth.
    pub queue_high_water_mark: usize,

    /// How long a faulted future may go unobserved before it is reported.
    #[serde(rename = "unobserved_fault_grace_ms", with = "millis")]
    pub unobserved_fault_grace: Duration,

    /// Fail fast with `SelfBlockDeadlock` instead of hanging.
    pub deadlock_detection: bool,
}

impl Default for Config {
    fn default() -> Self {
        let parallelism = thread::available_parallelism().map_or(4, |n| n.get());

        Self {
            min_threads: parallelism,
            max_threads: (parallelism * 8).max(16),
            worker_idle_timeout: Duration::from_secs(10),
            growth_interval: Duration::from_millis(500),
            queue_high_water_mark: parallelism * 4,
            unobserved_fault_grace: Duration::from_secs(2),
            deadlock_detection: cfg!(debug_assertions),
        }
    }
}

impl Config {
    /// Checks the invariants the pool and scheduler rely on.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.min_threads == 0 {
            return Err(RuntimeError::InvalidConfig(
                "min_threads must be at least 1".into(),
            ));
        }
        if self.max_threads < self.min_threads {
            return Err(RuntimeError::InvalidConfig(format!(
                "max_threads ({}) must not be below min_threads ({})",
                self.max_threads, self.min_threads
            )));
        }
        if self.growth_interval.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "growth_interval must be non-zero".into(),
            ));
        }
        if self.worker_idle_timeout.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "worker_idle_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
