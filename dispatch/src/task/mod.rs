// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Type-erased, movable-only units of work. See [`Task`] for details.

use std::{fmt,
          sync::{Arc, Weak}};

/// A movable, type-erased unit of work that can be invoked at most once.
///
/// A task wraps exactly one of the following at any time:
///
/// - nothing (the empty task - executing it is a no-op),
/// - an owned closure,
/// - a method bound to an owned target,
/// - a method bound to a shared ([`Arc`]) target,
/// - a method bound to a weak ([`Weak`]) target.
///
/// The weak variant exists so long-lived schedulers (queues, event sources) can hold
/// work bound to an object without keeping that object alive: if the target is gone by
/// the time the task runs, [`run()`] is a silent no-op rather than an error.
///
/// Tasks are deliberately not [`Clone`]. Ownership moves from the submitter to the
/// queue to the worker that finally calls [`run()`], which consumes the task. Use
/// [`take()`] to move a task out of a slot while leaving the empty task behind.
///
/// # Panics from user code
///
/// `Task` itself never panics. Panics raised by the wrapped closure or method
/// propagate to whoever called [`run()`]; the pool's worker loop catches and logs
/// them so one task cannot take down a worker thread.
///
/// [`run()`]: Self::run
/// [`take()`]: Self::take
pub struct Task {
    repr: TaskRepr,
}

/// The live variant. Exactly one is active; moving a task out of a slot (via
/// [`Task::take`]) leaves `Empty` behind.
enum TaskRepr {
    Empty,
    Closure(Box<dyn FnOnce() + Send + 'static>),
    Member(Box<dyn RunOnce>),
    WeakMember(Box<dyn RunOnce>),
}

/// Object-safe erasure for the bound-method variants.
trait RunOnce: Send {
    fn run_once(self: Box<Self>);
}

/// Method bound to a target the task owns outright.
struct OwnedMethod<T: Send> {
    target: T,
    method: fn(&mut T),
}

impl<T: Send> RunOnce for OwnedMethod<T> {
    fn run_once(mut self: Box<Self>) { (self.method)(&mut self.target); }
}

/// Method bound to a shared target; the task holds one strong reference.
struct SharedMethod<T: Send + Sync + ?Sized> {
    target: Arc<T>,
    method: fn(&T),
}

impl<T: Send + Sync + ?Sized> RunOnce for SharedMethod<T> {
    fn run_once(self: Box<Self>) { (self.method)(&self.target); }
}

/// Method bound to a weak target; resolved to a strong reference at execution time.
struct WeakMethod<T: Send + Sync + ?Sized> {
    target: Weak<T>,
    method: fn(&T),
}

impl<T: Send + Sync + ?Sized> RunOnce for WeakMethod<T> {
    fn run_once(self: Box<Self>) {
        match self.target.upgrade() {
            Some(target) => (self.method)(&target),
            // Dangling weak targets are not an error; the work is simply dropped.
            None => tracing::trace!("task target dropped before execution; skipping"),
        }
    }
}

impl Task {
    /// Wraps a closure. This is the common constructor.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            repr: TaskRepr::Closure(Box::new(f)),
        }
    }

    /// Binds `method` to a target the task owns. The target is dropped after the
    /// task runs (or when an unexecuted task is dropped).
    pub fn from_owned_member<T: Send + 'static>(target: T, method: fn(&mut T)) -> Self {
        Self {
            repr: TaskRepr::Member(Box::new(OwnedMethod { target, method })),
        }
    }

    /// Binds `method` to a shared target. The task holds one strong reference for
    /// its lifetime.
    pub fn from_member<T: Send + Sync + 'static>(target: Arc<T>, method: fn(&T)) -> Self {
        Self {
            repr: TaskRepr::Member(Box::new(SharedMethod { target, method })),
        }
    }

    /// Binds `method` to a weak target. If the target has been dropped by the time
    /// the task runs, the invocation is a silent no-op.
    pub fn from_weak_member<T: Send + Sync + 'static>(
        target: Weak<T>,
        method: fn(&T),
    ) -> Self {
        Self {
            repr: TaskRepr::WeakMember(Box::new(WeakMethod { target, method })),
        }
    }

    /// Returns true for the empty task (default-constructed, or left behind by
    /// [`take()`](Self::take)).
    #[must_use]
    pub fn is_empty(&self) -> bool { matches!(self.repr, TaskRepr::Empty) }

    /// Moves the task out of `self`, leaving the empty task behind.
    #[must_use]
    pub fn take(&mut self) -> Self {
        Self {
            repr: std::mem::replace(&mut self.repr, TaskRepr::Empty),
        }
    }

    /// Executes the wrapped work, consuming the task.
    pub fn run(self) {
        match self.repr {
            TaskRepr::Empty => {}
            TaskRepr::Closure(f) => f(),
            TaskRepr::Member(m) | TaskRepr::WeakMember(m) => m.run_once(),
        }
    }
}

impl Default for Task {
    /// The empty task.
    fn default() -> Self { Self { repr: TaskRepr::Empty } }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match self.repr {
            TaskRepr::Empty => "Empty",
            TaskRepr::Closure(_) => "Closure",
            TaskRepr::Member(_) => "Member",
            TaskRepr::WeakMember(_) => "WeakMember",
        };
        f.debug_struct("Task").field("repr", &variant).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Tally {
        hits: AtomicUsize,
    }

    impl Tally {
        fn bump(&self) { self.hits.fetch_add(1, Ordering::SeqCst); }

        fn count(&self) -> usize { self.hits.load(Ordering::SeqCst) }
    }

    #[test]
    fn empty_task_is_a_no_op() {
        let task = Task::default();
        assert!(task.is_empty());
        task.run();
    }

    #[test]
    fn closure_task_runs_exactly_once() {
        let tally = Arc::new(Tally::default());
        let captured = Arc::clone(&tally);
        let task = Task::new(move || captured.bump());
        assert!(!task.is_empty());
        task.run();
        assert_eq!(tally.count(), 1);
    }

    #[test]
    fn owned_member_task_mutates_its_target() {
        let seen = Arc::new(Tally::default());
        let task = Task::from_owned_member(Arc::clone(&seen), |target| target.bump());
        task.run();
        assert_eq!(seen.count(), 1);
    }

    #[test]
    fn shared_member_task_calls_method_on_target() {
        let tally = Arc::new(Tally::default());
        let task = Task::from_member(Arc::clone(&tally), Tally::bump);
        task.run();
        assert_eq!(tally.count(), 1);
    }

    #[test]
    fn weak_member_task_fires_while_target_lives() {
        let tally = Arc::new(Tally::default());
        let task = Task::from_weak_member(Arc::downgrade(&tally), Tally::bump);
        task.run();
        assert_eq!(tally.count(), 1);
    }

    #[test]
    fn weak_member_task_is_a_no_op_after_target_drops() {
        let tally = Arc::new(Tally::default());
        let task = Task::from_weak_member(Arc::downgrade(&tally), Tally::bump);
        drop(tally);
        // Must not panic; the dangling target makes this a no-op.
        task.run();
    }

    #[test]
    fn take_leaves_the_empty_task_behind() {
        let tally = Arc::new(Tally::default());
        let captured = Arc::clone(&tally);
        let mut slot = Task::new(move || captured.bump());

        let taken = slot.take();
        assert!(slot.is_empty());
        assert!(!taken.is_empty());

        taken.run();
        slot.run();
        assert_eq!(tally.count(), 1);
    }

    #[test]
    fn tasks_move_across_threads() {
        let tally = Arc::new(Tally::default());
        let captured = Arc::clone(&tally);
        let task = Task::new(move || captured.bump());

        std::thread::spawn(move || task.run()).join().unwrap();
        assert_eq!(tally.count(), 1);
    }
}
