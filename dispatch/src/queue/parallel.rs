// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Unordered submission endpoint backed by a lock-free MPMC queue. See
//! [`ParallelQueue`].

use super::{QueueItem, RegularItem, TaskQueue, submit_sync};
use crate::{group::Group, task::Task, thread_pool::{QueueCore, ThreadPool}};
use crossbeam_queue::SegQueue;
use std::{fmt, sync::Arc};

#[cfg(feature = "barrier")]
use super::barrier::BarrierCell;
#[cfg(feature = "barrier")]
use parking_lot::Mutex;

/// A queue whose tasks may run concurrently on any worker, in any order.
///
/// Submission order does not constrain execution order; tasks become available to
/// every pool worker the moment they are pushed. The container is a lock-free
/// multi-producer multi-consumer FIFO, so the submission hot path takes no lock
/// (unless the `barrier` feature is active, which serialises pushes against
/// barrier bookkeeping).
///
/// Cloning the handle is cheap and yields the same queue. The pool only holds a
/// weak registration, which workers prune once the queue is gone.
///
/// With the `barrier` feature, [`barrier_spawn()`](Self::barrier_spawn) inserts a
/// serialising fence: every task submitted before the fence finishes before the
/// fence's callable runs, and every task submitted after it starts only once the
/// callable is done.
#[derive(Clone)]
pub struct ParallelQueue {
    core: Arc<ParallelQueueCore>,
}

pub(crate) struct ParallelQueueCore {
    items: SegQueue<QueueItem>,
    pool: ThreadPool,
    /// The most recently submitted barrier; new tasks gate on it. Also serialises
    /// pushes so a barrier item always precedes the tasks attached to it.
    #[cfg(feature = "barrier")]
    newest_barrier: Mutex<Arc<BarrierCell>>,
}

impl ParallelQueue {
    /// Creates a parallel queue and registers it with `pool`.
    #[must_use]
    pub fn new(pool: &ThreadPool) -> Self {
        let core = Arc::new(ParallelQueueCore {
            items: SegQueue::new(),
            pool: pool.clone(),
            #[cfg(feature = "barrier")]
            newest_barrier: Mutex::new(Arc::new(BarrierCell::root())),
        });
        let core_dyn: Arc<dyn QueueCore> = core.clone();
        pool.add_queue(Arc::downgrade(&core_dyn));
        Self { core }
    }

    /// Enqueues `task` and blocks until it has executed, returning the closure's
    /// value. Panics inside `f` are re-raised on the calling thread.
    ///
    /// Do not call from a worker of the same pool with `max_workers == 1` (the
    /// only worker would be the caller), or after the pool stopped (the task
    /// would never run and this call would never return).
    pub fn sync<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        submit_sync(self, f)
    }

    /// Appends a serialising fence to the queue.
    ///
    /// The pool runs `task` after every previously submitted task has finished;
    /// tasks submitted afterwards wait for `task` to finish. If `task` stops the
    /// pool, workers blocked on the fence terminate instead of proceeding.
    #[cfg(feature = "barrier")]
    pub fn barrier_spawn(&self, task: Task) {
        let core = &self.core;
        {
            let mut newest = core.newest_barrier.lock();
            let cell = Arc::new(BarrierCell::pending(
                task,
                Arc::clone(newest.successor_gate()),
            ));
            *newest = Arc::clone(&cell);
            // Push while holding the lock: the barrier item must precede, in queue
            // order, every task that gates on it.
            core.items.push(QueueItem::Barrier(cell));
        }
        core.pool.notify();
    }

    fn spawn_impl(&self, task: Task, group: Option<Group>) {
        #[cfg_attr(not(feature = "barrier"), allow(unused_mut))]
        let mut item = RegularItem::new(task, group);
        #[cfg(feature = "barrier")]
        {
            let newest = self.core.newest_barrier.lock();
            newest.successor_gate().add();
            item.barrier = Some(Arc::clone(&*newest));
            self.core.items.push(QueueItem::Regular(item));
        }
        #[cfg(not(feature = "barrier"))]
        self.core.items.push(QueueItem::Regular(item));
        self.core.pool.notify();
    }
}

impl TaskQueue for ParallelQueue {
    fn spawn(&self, task: Task) { self.spawn_impl(task, None); }

    fn group_spawn(&self, group: &Group, task: Task) {
        self.spawn_impl(task, Some(group.clone()));
    }
}

impl QueueCore for ParallelQueueCore {
    fn try_dequeue(&self) -> Option<QueueItem> { self.items.pop() }
}

impl fmt::Debug for ParallelQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelQueue")
            .field("pending", &self.core.items.len())
            .finish()
    }
}
