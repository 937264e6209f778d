// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Counting barrier for joining fan-out work. See [`Group`].

use crate::{queue::TaskQueue, task::Task};
use parking_lot::{Condvar, Mutex};
use std::{fmt, sync::Arc};

/// A counting barrier that tracks a set of outstanding tasks.
///
/// A group is a monotonic counter with blocking semantics: [`enter()`] increments it,
/// [`exit()`] decrements it, and [`wait()`] blocks the caller until it reaches zero.
/// Queues pair the two calls for you - `group_spawn` enters the group before
/// submission and the worker exits it after the task returns - so the typical use is
/// fan-out/join:
///
/// ```
/// use biodispatch::{Group, ParallelQueue, Task, TaskQueue, ThreadPool};
///
/// let pool = ThreadPool::default();
/// let queue = ParallelQueue::new(&pool);
/// let group = Group::new();
/// for _ in 0..8 {
///     queue.group_spawn(&group, Task::new(|| { /* chunk of work */ }));
/// }
/// group.wait(); // All eight tasks have returned.
/// pool.stop(true);
/// ```
///
/// Cloning a group is cheap and yields a handle to the same counter.
///
/// # Ordering
///
/// Every memory write made by a task that called [`exit()`] happens-before the return
/// of the [`wait()`] that observed the counter reach zero (the counter lives behind a
/// mutex, which provides the release/acquire edge).
///
/// # Reuse
///
/// A group may be reused for another fan-out phase once a prior [`wait()`] has
/// returned, provided no `wait` call is concurrent with the reuse.
///
/// [`enter()`]: Self::enter
/// [`exit()`]: Self::exit
/// [`wait()`]: Self::wait
#[derive(Clone, Default)]
pub struct Group {
    inner: Arc<GroupInner>,
}

#[derive(Default)]
struct GroupInner {
    state: Mutex<GroupState>,
    cond: Condvar,
}

#[derive(Default)]
struct GroupState {
    count: usize,
    /// Continuations registered via [`Group::notify`], fired on the next drain.
    continuations: Vec<(Box<dyn TaskQueue>, Task)>,
}

impl Group {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Increments the outstanding-task counter.
    pub fn enter(&self) { self.inner.state.lock().count += 1; }

    /// Decrements the outstanding-task counter. On reaching zero, wakes every
    /// [`wait()`](Self::wait)er and submits any registered drain continuations to
    /// their queues.
    ///
    /// # Panics
    ///
    /// Panics if called more times than [`enter()`](Self::enter) - an unbalanced
    /// exit is a logic error, not a recoverable condition.
    pub fn exit(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            assert!(state.count > 0, "Group::exit() without a matching enter()");
            state.count -= 1;
            if state.count > 0 {
                return;
            }
            self.inner.cond.notify_all();
            std::mem::take(&mut state.continuations)
        };

        // Submit outside the group lock: queue submission takes pool locks and may
        // spawn a worker thread.
        for (queue, task) in drained {
            queue.spawn(task);
        }
    }

    /// Blocks the calling thread until the counter reaches zero. Returns immediately
    /// if it already is.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while state.count > 0 {
            self.inner.cond.wait(&mut state);
        }
    }

    /// Registers `task` to be submitted to `queue` when the counter next reaches
    /// zero. If the counter is already zero, the task is submitted immediately.
    pub fn notify(&self, queue: impl TaskQueue + 'static, task: Task) {
        {
            let mut state = self.inner.state.lock();
            if state.count > 0 {
                state.continuations.push((Box::new(queue), task));
                return;
            }
        }
        queue.spawn(task);
    }

    /// Current counter value. Meaningful only for diagnostics; it may be stale the
    /// moment it is read.
    #[must_use]
    pub fn outstanding(&self) -> usize { self.inner.state.lock().count }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{sync::atomic::{AtomicUsize, Ordering},
              time::Duration};

    #[test]
    fn wait_returns_immediately_when_never_entered() {
        let group = Group::new();
        group.wait();
        assert_eq!(group.outstanding(), 0);
    }

    #[test]
    fn enter_and_exit_balance_to_zero() {
        let group = Group::new();
        group.enter();
        group.enter();
        assert_eq!(group.outstanding(), 2);
        group.exit();
        group.exit();
        assert_eq!(group.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "without a matching enter")]
    fn unbalanced_exit_panics() {
        let group = Group::new();
        group.exit();
    }

    #[test]
    fn wait_blocks_until_the_last_exit() {
        let group = Group::new();
        group.enter();

        let waiter_group = group.clone();
        let released = Arc::new(AtomicUsize::new(0));
        let released_in_waiter = Arc::clone(&released);
        let waiter = std::thread::spawn(move || {
            waiter_group.wait();
            released_in_waiter.store(1, Ordering::SeqCst);
        });

        // The waiter must still be blocked while the counter is non-zero.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(released.load(Ordering::SeqCst), 0);

        group.exit();
        waiter.join().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn group_is_reusable_across_phases() {
        let group = Group::new();
        for _ in 0..2 {
            group.enter();
            group.exit();
            group.wait();
            assert_eq!(group.outstanding(), 0);
        }
    }
}
