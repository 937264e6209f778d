// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Strictly ordered submission endpoint. See [`SerialQueue`].

use super::{QueueItem, RegularItem, TaskQueue, submit_sync};
use crate::{group::Group, task::Task, thread_pool::{QueueCore, ThreadPool}};
use parking_lot::Mutex;
use std::{collections::VecDeque,
          fmt,
          sync::{Arc, Weak,
                 atomic::{AtomicBool, Ordering}}};

/// A queue that executes tasks one at a time, in submission order.
///
/// At most one task from this queue is executing at any moment, and for any two
/// tasks submitted in order, the first one's completion happens-before the second
/// one's start. This makes a serial queue a mutual-exclusion domain: state touched
/// only from tasks on one serial queue needs no further locking.
///
/// # Drain scheduling
///
/// The single-drainer guarantee rests on one atomic flag. A worker may only take a
/// task from this queue by winning a compare-and-swap on the flag; it holds the
/// flag for the duration of the task and releases it afterwards, re-notifying the
/// pool when more tasks are pending. Losing workers simply move on to the next
/// queue in their round-robin pass, so the pool mutex is never held across task
/// execution.
///
/// Cloning the handle is cheap and yields the same queue.
#[derive(Clone)]
pub struct SerialQueue {
    core: Arc<SerialQueueCore>,
}

pub(crate) struct SerialQueueCore {
    fifo: Mutex<VecDeque<RegularItem>>,
    /// True while a worker is between dequeuing a task and finishing it. The
    /// exactly-one-drainer invariant.
    executing: AtomicBool,
    pool: ThreadPool,
    /// Handed to dequeued items so the executing worker can call
    /// [`finish_one()`](Self::finish_one).
    me: Weak<SerialQueueCore>,
}

impl SerialQueue {
    /// Creates a serial queue and registers it with `pool`.
    #[must_use]
    pub fn new(pool: &ThreadPool) -> Self {
        let core = Arc::new_cyclic(|me| SerialQueueCore {
            fifo: Mutex::new(VecDeque::new()),
            executing: AtomicBool::new(false),
            pool: pool.clone(),
            me: me.clone(),
        });
        let core_dyn: Arc<dyn QueueCore> = core.clone();
        pool.add_queue(Arc::downgrade(&core_dyn));
        Self { core }
    }

    /// Enqueues `task` and blocks until it has executed, returning the closure's
    /// value. Panics inside `f` are re-raised on the calling thread.
    ///
    /// Calling this from a task running on the *same* serial queue deadlocks: the
    /// queue's single drainer would wait on itself. Calling it after the pool
    /// stopped never returns, because the task never runs.
    pub fn sync<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        submit_sync(self, f)
    }

    fn spawn_impl(&self, task: Task, group: Option<Group>) {
        let item = RegularItem::new(task, group);
        self.core.fifo.lock().push_back(item);
        // First enqueue schedules the drain; while a drainer is active, appends
        // ride along and finish_one() keeps the drain going.
        if !self.core.executing.load(Ordering::Acquire) {
            self.core.pool.notify();
        }
    }
}

impl TaskQueue for SerialQueue {
    fn spawn(&self, task: Task) { self.spawn_impl(task, None); }

    fn group_spawn(&self, group: &Group, task: Task) {
        self.spawn_impl(task, Some(group.clone()));
    }
}

impl SerialQueueCore {
    /// Called by the worker after the dequeued task (and its bookkeeping) ran.
    /// Releases the drainer flag and wakes the pool if more tasks are pending.
    pub(crate) fn finish_one(&self) {
        self.executing.store(false, Ordering::Release);
        // The emptiness check and the store above are both visible to spawn_impl
        // under the fifo lock, so a concurrent append either sees executing ==
        // false and notifies, or is seen here and re-notified.
        if !self.fifo.lock().is_empty() {
            self.pool.notify();
        }
    }
}

impl QueueCore for SerialQueueCore {
    fn try_dequeue(&self) -> Option<QueueItem> {
        if self
            .executing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another worker is draining; strict ordering forbids a second one.
            return None;
        }

        let mut fifo = self.fifo.lock();
        match fifo.pop_front() {
            Some(mut item) => {
                item.serial = self.me.upgrade();
                Some(QueueItem::Regular(item))
            }
            None => {
                // Release under the fifo lock so a concurrent append cannot miss
                // the flag reset.
                self.executing.store(false, Ordering::Release);
                None
            }
        }
    }
}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue")
            .field("pending", &self.core.fifo.lock().len())
            .field("executing", &self.core.executing.load(Ordering::Relaxed))
            .finish()
    }
}
