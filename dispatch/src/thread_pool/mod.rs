// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Dynamic worker pool multiplexing task queues. See [`ThreadPool`].

// Attach.
pub mod builder;
pub(crate) mod worker;

// Re-export.
pub use builder::ThreadPoolBuilder;

use crate::queue::QueueItem;
use parking_lot::{Condvar, Mutex, RwLock};
use std::{fmt,
          sync::{Arc, Weak,
                 atomic::{AtomicU64, Ordering}},
          time::Duration};

/// Internal dequeue surface a queue exposes to pool workers.
///
/// Workers iterate the registered cores round-robin, attempting one dequeue per
/// core per pass. A core returns `None` both when it is empty and when its own
/// ordering rules forbid a dequeue right now (a serial queue with a drainer in
/// flight).
pub(crate) trait QueueCore: Send + Sync {
    fn try_dequeue(&self) -> Option<QueueItem>;
}

/// A dynamically sized set of worker threads draining the queues registered with
/// it.
///
/// Workers are started greedily: a [`notify()`] that finds no idle worker starts a
/// new one, up to `max_workers`. They are reaped lazily: a worker that has been
/// idle for `max_idle_time` exits on its own (but never below `min_workers`).
/// There is no busy-waiting - every transition between idle and active goes
/// through the pool's condition variable or a queue's own try-dequeue.
///
/// The pool holds only weak references to its queues; queues register themselves
/// on construction and the pool forgets them once they are dropped, so a
/// forgotten queue handle never keeps the pool alive or vice versa. Queue
/// registration takes the registry lock exclusively, which a draining worker
/// holds shared - do not construct new queues from inside a task running on the
/// same pool.
///
/// Cloning the handle is cheap and yields the same pool. Configure via
/// [`ThreadPool::builder()`]; [`ThreadPool::default()`] gives
/// ⌊1.5 × available parallelism⌋ workers with a 5 s idle timeout.
///
/// # Shutdown
///
/// [`stop(false)`](Self::stop) flips the terminal `should_continue` flag and wakes
/// every worker; workers finish their current drain pass and exit when they next
/// consult the flag. [`stop(true)`](Self::stop) additionally blocks until every
/// worker has exited, as does [`wait()`](Self::wait) on its own.
///
/// [`notify()`]: Self::notify
#[derive(Clone)]
pub struct ThreadPool {
    pub(crate) inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    pub(crate) state: Mutex<PoolState>,
    /// Idle workers sleep here; [`ThreadPool::notify`] and stop wake them.
    pub(crate) cv: Condvar,
    /// [`ThreadPool::wait`] sleeps here until the last worker exits.
    pub(crate) stop_cv: Condvar,
    /// Registered queues, in registration order (round-robin order). Read-held
    /// while a worker drains; write-held only for register/prune.
    pub(crate) queues: RwLock<Vec<Weak<dyn QueueCore>>>,
    pub(crate) config: PoolConfig,
    next_worker_ordinal: AtomicU64,
}

#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) max_workers: usize,
    pub(crate) min_workers: usize,
    pub(crate) max_idle_time: Duration,
    pub(crate) thread_name_prefix: String,
}

/// Mutable pool state; every field is guarded by [`PoolInner::state`].
pub(crate) struct PoolState {
    pub(crate) current_workers: usize,
    /// Workers blocked on the condition variable.
    pub(crate) idle_workers: usize,
    /// Wake-ups handed out by [`ThreadPool::notify`] not yet consumed by a woken
    /// worker; distinguishes real notifications from spurious wake-ups.
    pub(crate) notified_workers: usize,
    /// Submissions minus completions, for diagnostics.
    pub(crate) waiting_tasks: i64,
    /// `false` is terminal; set by [`ThreadPool::stop`].
    pub(crate) should_continue: bool,
}

impl ThreadPool {
    /// A pool with the default configuration (see [`ThreadPoolBuilder`]).
    #[must_use]
    pub fn new() -> Self { ThreadPoolBuilder::new().build() }

    #[must_use]
    pub fn builder() -> ThreadPoolBuilder { ThreadPoolBuilder::new() }

    pub(crate) fn with_config(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    current_workers: 0,
                    idle_workers: 0,
                    notified_workers: 0,
                    waiting_tasks: 0,
                    should_continue: true,
                }),
                cv: Condvar::new(),
                stop_cv: Condvar::new(),
                queues: RwLock::new(Vec::new()),
                config,
                next_worker_ordinal: AtomicU64::new(0),
            }),
        }
    }

    /// Signals that a queue has new work: wakes an idle worker if there is one,
    /// otherwise starts a new worker unless `max_workers` are already running.
    ///
    /// Queues call this on every submission; applications normally never need to.
    pub fn notify(&self) {
        let mut state = self.inner.state.lock();
        state.waiting_tasks += 1;

        if state.idle_workers > 0 {
            state.idle_workers -= 1;
            state.notified_workers += 1;
            drop(state);
            self.inner.cv.notify_one();
            return;
        }

        if state.current_workers < self.inner.config.max_workers {
            self.start_worker_locked(&mut state);
        }
        // Otherwise: every worker is busy; one of them will find the task on its
        // next drain pass.
    }

    /// Stops the pool: no worker survives its next visit to the condition
    /// variable. Tasks already picked up by a worker's drain pass still run.
    /// With `wait`, blocks until every worker has exited.
    pub fn stop(&self, wait: bool) {
        {
            self.inner.state.lock().should_continue = false;
        }
        self.inner.cv.notify_all();
        if wait {
            self.wait();
        }
    }

    /// Blocks until the pool has no workers left. Without a prior
    /// [`stop()`](Self::stop) this means waiting for every worker to idle out,
    /// which never happens when `min_workers > 0`.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while state.current_workers > 0 {
            self.inner.stop_cv.wait(&mut state);
        }
    }

    #[must_use]
    pub fn max_workers(&self) -> usize { self.inner.config.max_workers }

    /// Number of live worker threads right now. Diagnostic; may be stale the
    /// moment it is read.
    #[must_use]
    pub fn current_workers(&self) -> usize { self.inner.state.lock().current_workers }

    pub(crate) fn add_queue(&self, queue: Weak<dyn QueueCore>) {
        self.inner.queues.write().push(queue);
    }

    /// Forgets queues whose cores have been dropped.
    pub(crate) fn prune_queues(&self) {
        self.inner
            .queues
            .write()
            .retain(|queue| queue.strong_count() > 0);
    }

    /// Starts one worker thread. Caller holds the state lock.
    fn start_worker_locked(&self, state: &mut PoolState) {
        let ordinal = self.inner.next_worker_ordinal.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{ordinal}", self.inner.config.thread_name_prefix);
        state.current_workers += 1;

        let pool = self.clone();
        let spawned = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker::run(&pool));

        match spawned {
            // Workers are detached; shutdown is observed via the stop condvar,
            // not by joining handles.
            Ok(_handle) => {}
            Err(error) => {
                state.current_workers -= 1;
                tracing::error!(%error, "failed to spawn a pool worker thread");
            }
        }
    }
}

impl Default for ThreadPool {
    fn default() -> Self { Self::new() }
}

impl PoolInner {
    /// Removes the calling worker from the pool's books, waking
    /// [`ThreadPool::wait`]ers when it was the last one. Caller holds the state
    /// lock.
    pub(crate) fn remove_worker_locked(&self, state: &mut PoolState) {
        debug_assert!(state.current_workers > 0);
        state.current_workers -= 1;
        if state.current_workers == 0 {
            self.stop_cv.notify_all();
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ThreadPool")
            .field("max_workers", &self.inner.config.max_workers)
            .field("current_workers", &state.current_workers)
            .field("idle_workers", &state.idle_workers)
            .field("waiting_tasks", &state.waiting_tasks)
            .field("should_continue", &state.should_continue)
            .finish()
    }
}
