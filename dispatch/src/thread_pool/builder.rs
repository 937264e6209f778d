// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Configuration builder for [`ThreadPool`]. See [`ThreadPoolBuilder`].

use super::{PoolConfig, ThreadPool};
use std::time::Duration;

/// Builder for [`ThreadPool`] with sensible defaults.
///
/// | Setting              | Default                                 |
/// | :------------------- | :-------------------------------------- |
/// | `max_workers`        | ⌊1.5 × available parallelism⌋, min 1    |
/// | `min_workers`        | 0 (the pool may shrink to nothing)      |
/// | `max_idle_time`      | 5 s                                     |
/// | `thread_name_prefix` | `dispatch-worker`                       |
///
/// ```
/// use biodispatch::ThreadPool;
/// use std::time::Duration;
///
/// let pool = ThreadPool::builder()
///     .max_workers(8)
///     .max_idle_time(Duration::from_secs(1))
///     .build();
/// # pool.stop(true);
/// ```
#[derive(Debug, Clone)]
pub struct ThreadPoolBuilder {
    max_workers: Option<usize>,
    min_workers: usize,
    max_idle_time: Duration,
    thread_name_prefix: String,
}

/// Workers sleeping longer than this remove themselves from the pool.
const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(5);

impl ThreadPoolBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_workers: None,
            min_workers: 0,
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            thread_name_prefix: "dispatch-worker".into(),
        }
    }

    /// Upper bound on concurrent worker threads. Clamped to at least 1.
    #[must_use]
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers.max(1));
        self
    }

    /// Number of workers the idle reaper leaves alive. Clamped to
    /// `max_workers` at build time.
    #[must_use]
    pub fn min_workers(mut self, min_workers: usize) -> Self {
        self.min_workers = min_workers;
        self
    }

    /// How long a worker may sit idle before removing itself from the pool.
    #[must_use]
    pub fn max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = max_idle_time;
        self
    }

    /// Worker threads are named `<prefix>-<ordinal>`.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn build(self) -> ThreadPool {
        let max_workers = self.max_workers.unwrap_or_else(default_max_workers);
        ThreadPool::with_config(PoolConfig {
            max_workers,
            min_workers: self.min_workers.min(max_workers),
            max_idle_time: self.max_idle_time,
            thread_name_prefix: self.thread_name_prefix,
        })
    }
}

impl Default for ThreadPoolBuilder {
    fn default() -> Self { Self::new() }
}

/// ⌊1.5 × available parallelism⌋, and at least one.
fn default_max_workers() -> usize {
    let hardware = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    (hardware.saturating_mul(3) / 2).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_max_workers_is_at_least_one() {
        assert!(default_max_workers() >= 1);
    }

    #[test]
    fn max_workers_is_clamped_to_one() {
        let pool = ThreadPoolBuilder::new().max_workers(0).build();
        assert_eq!(pool.max_workers(), 1);
    }

    #[test]
    fn min_workers_cannot_exceed_max_workers() {
        let pool = ThreadPoolBuilder::new()
            .max_workers(2)
            .min_workers(10)
            .build();
        assert_eq!(pool.inner.config.min_workers, 2);
        pool.stop(true);
    }
}
