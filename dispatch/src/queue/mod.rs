// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Task submission endpoints: strictly ordered ([`SerialQueue`]) and unordered
//! ([`ParallelQueue`]) queues multiplexed onto a [`ThreadPool`].
//!
//! [`ThreadPool`]: crate::ThreadPool

// Attach.
#[cfg(feature = "barrier")]
pub(crate) mod barrier;
pub mod parallel;
pub mod serial;

// Re-export.
pub use parallel::ParallelQueue;
pub use serial::SerialQueue;

use crate::{group::Group, task::Task};
use parking_lot::{Condvar, Mutex};
use std::{panic::{AssertUnwindSafe, catch_unwind, resume_unwind},
          sync::Arc,
          thread};

#[cfg(feature = "barrier")]
use barrier::BarrierCell;

/// Common submission surface shared by [`SerialQueue`] and [`ParallelQueue`].
///
/// Object-safe so schedulers (groups, event sources) can hold a queue of either
/// kind. The blocking [`sync`](SerialQueue::sync) submission lives on the concrete
/// types because it is generic over the closure's return type.
pub trait TaskQueue: Send + Sync {
    /// Enqueues `task` and returns immediately; the task runs later on a pool
    /// worker.
    fn spawn(&self, task: Task);

    /// Like [`spawn()`](Self::spawn), but `group` is entered before submission and
    /// exited by the worker after the task returns.
    fn group_spawn(&self, group: &Group, task: Task);
}

/// One unit of work as stored in a queue and handed to a worker.
pub(crate) enum QueueItem {
    Regular(RegularItem),
    /// A barrier token; see [`barrier::BarrierCell`].
    #[cfg(feature = "barrier")]
    Barrier(Arc<BarrierCell>),
}

pub(crate) struct RegularItem {
    pub(crate) task: Task,
    /// Exited by the worker after the task returns.
    pub(crate) group: Option<Group>,
    /// Completion hook of the owning serial queue; filled in at dequeue time.
    pub(crate) serial: Option<Arc<serial::SerialQueueCore>>,
    /// The newest barrier at submission time; the task may only run once it is
    /// passable, and its completion is counted towards the next barrier's prefix.
    #[cfg(feature = "barrier")]
    pub(crate) barrier: Option<Arc<BarrierCell>>,
}

impl RegularItem {
    pub(crate) fn new(task: Task, group: Option<Group>) -> Self {
        if let Some(group) = &group {
            // Entered before submission; the worker exits after execution.
            group.enter();
        }
        Self {
            task,
            group,
            serial: None,
            #[cfg(feature = "barrier")]
            barrier: None,
        }
    }
}

/// Completion slot shared between a `sync` submitter and the worker that runs the
/// submitted closure.
struct SyncSlot<R> {
    result: Mutex<Option<thread::Result<R>>>,
    cond: Condvar,
}

/// Submits `f` to `queue` and blocks the caller until it has executed, returning
/// its value. A panic inside `f` is re-raised on the calling thread; the worker
/// that ran it is unaffected.
///
/// Calling this from a worker of the same pool can deadlock (the serial queue's
/// single drainer would wait on itself); submit from application threads.
pub(crate) fn submit_sync<Q, R, F>(queue: &Q, f: F) -> R
where
    Q: TaskQueue + ?Sized,
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let slot = Arc::new(SyncSlot {
        result: Mutex::new(None),
        cond: Condvar::new(),
    });

    let worker_slot = Arc::clone(&slot);
    queue.spawn(Task::new(move || {
        let outcome = catch_unwind(AssertUnwindSafe(f));
        let mut result = worker_slot.result.lock();
        *result = Some(outcome);
        worker_slot.cond.notify_one();
    }));

    let mut result = slot.result.lock();
    while result.is_none() {
        slot.cond.wait(&mut result);
    }
    match result.take().expect("sync completion slot filled") {
        Ok(value) => value,
        Err(payload) => resume_unwind(payload),
    }
}
