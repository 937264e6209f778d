// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Serialising fence inside a parallel queue. See [`BarrierCell`].
//!
//! Only compiled with the `barrier` cargo feature.

use crate::task::Task;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Execution phase of a barrier. Transitions are monotone:
/// `NotExecuted -> Executing -> {Done | DoStop}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BarrierPhase {
    /// Submitted, not yet claimed by a worker.
    NotExecuted,
    /// A worker won the claim and is waiting for the prefix / running the callable.
    Executing,
    /// The callable finished; tasks submitted after the barrier may run.
    Done,
    /// The callable stopped the pool; waiting workers must terminate.
    DoStop,
}

/// Counts outstanding work a barrier has to wait for before its callable may run.
///
/// Each barrier owns one gate (its *successor* gate). The gate counts every task
/// submitted while that barrier was the queue's newest barrier, plus one slot for
/// the barrier's own completion. The **next** barrier waits on it, which is exactly
/// "everything submitted before me - including the previous barrier - has finished".
pub(crate) struct Gate {
    pending: Mutex<usize>,
    cond: Condvar,
}

impl Gate {
    pub(crate) fn new(initial: usize) -> Self {
        Self {
            pending: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Registers one more unit of work the gate must wait for.
    pub(crate) fn add(&self) { *self.pending.lock() += 1; }

    /// Marks one unit of work as finished, waking waiters on the last one.
    pub(crate) fn arrive(&self) {
        let mut pending = self.pending.lock();
        debug_assert!(*pending > 0, "Gate::arrive() without a matching add()");
        *pending -= 1;
        if *pending == 0 {
            self.cond.notify_all();
        }
    }

    /// Blocks until every registered unit of work has arrived.
    pub(crate) fn wait_zero(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.cond.wait(&mut pending);
        }
    }
}

/// State shared between a barrier queue item, the tasks gated on it, and the
/// queue's submission path.
///
/// The worker that dequeues the barrier item claims it by moving the phase from
/// [`NotExecuted`] to [`Executing`] (the claim is unique because the item is).
/// It then waits for the prefix gate, runs the callable, and publishes [`Done`] -
/// or [`DoStop`] if the callable stopped the pool, in which case every worker
/// blocked on this barrier terminates instead of proceeding.
///
/// [`Done`]: BarrierPhase::Done
/// [`DoStop`]: BarrierPhase::DoStop
/// [`Executing`]: BarrierPhase::Executing
/// [`NotExecuted`]: BarrierPhase::NotExecuted
pub(crate) struct BarrierCell {
    phase: Mutex<BarrierPhase>,
    cond: Condvar,
    task: Mutex<Option<Task>>,
    /// Gate of the *previous* barrier; this barrier's callable runs only after it
    /// reports zero.
    prefix_gate: Arc<Gate>,
    /// Gate the *next* barrier will wait on. Holds one slot for this barrier's own
    /// completion plus one per task submitted while this barrier is newest.
    successor_gate: Arc<Gate>,
}

impl BarrierCell {
    /// The implicit barrier a fresh queue starts with: already done, nothing to
    /// wait for, successor gate empty.
    pub(crate) fn root() -> Self {
        Self {
            phase: Mutex::new(BarrierPhase::Done),
            cond: Condvar::new(),
            task: Mutex::new(None),
            prefix_gate: Arc::new(Gate::new(0)),
            successor_gate: Arc::new(Gate::new(0)),
        }
    }

    /// A pending barrier whose callable is `task` and whose prefix is everything
    /// counted by the previous barrier's successor gate.
    pub(crate) fn pending(task: Task, prefix_gate: Arc<Gate>) -> Self {
        Self {
            phase: Mutex::new(BarrierPhase::NotExecuted),
            cond: Condvar::new(),
            task: Mutex::new(Some(task)),
            prefix_gate,
            // One slot for this barrier itself; released by publish().
            successor_gate: Arc::new(Gate::new(1)),
        }
    }

    pub(crate) fn successor_gate(&self) -> &Arc<Gate> { &self.successor_gate }

    /// Claims the barrier for execution. Returns false if some worker already did
    /// (which means the queue delivered the same barrier item twice - a bug).
    pub(crate) fn claim(&self) -> bool {
        let mut phase = self.phase.lock();
        if *phase == BarrierPhase::NotExecuted {
            *phase = BarrierPhase::Executing;
            true
        } else {
            false
        }
    }

    /// Blocks until every task submitted before this barrier (and the previous
    /// barrier) has finished. Only the claiming worker may call this.
    pub(crate) fn wait_for_prefix(&self) { self.prefix_gate.wait_zero(); }

    pub(crate) fn take_task(&self) -> Task {
        self.task.lock().take().unwrap_or_default()
    }

    /// Publishes the terminal phase ([`Done`] or [`DoStop`]), wakes every worker
    /// blocked on the barrier, and releases this barrier's slot in its successor
    /// gate.
    ///
    /// [`Done`]: BarrierPhase::Done
    /// [`DoStop`]: BarrierPhase::DoStop
    pub(crate) fn publish(&self, terminal: BarrierPhase) {
        debug_assert!(matches!(
            terminal,
            BarrierPhase::Done | BarrierPhase::DoStop
        ));
        {
            let mut phase = self.phase.lock();
            *phase = terminal;
            self.cond.notify_all();
        }
        self.successor_gate.arrive();
    }

    /// Blocks until the barrier reaches a terminal phase and returns it. Used by
    /// workers holding a task submitted after this barrier.
    pub(crate) fn wait_until_passable(&self) -> BarrierPhase {
        let mut phase = self.phase.lock();
        while matches!(
            *phase,
            BarrierPhase::NotExecuted | BarrierPhase::Executing
        ) {
            self.cond.wait(&mut phase);
        }
        *phase
    }
}

impl std::fmt::Debug for BarrierCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierCell")
            .field("phase", &*self.phase.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_releases_waiters_at_zero() {
        let gate = Arc::new(Gate::new(0));
        gate.add();
        gate.add();

        let waiter_gate = Arc::clone(&gate);
        let waiter = std::thread::spawn(move || waiter_gate.wait_zero());

        gate.arrive();
        gate.arrive();
        waiter.join().unwrap();
    }

    #[test]
    fn claim_succeeds_exactly_once() {
        let cell = BarrierCell::pending(Task::default(), Arc::new(Gate::new(0)));
        assert!(cell.claim());
        assert!(!cell.claim());
    }

    #[test]
    fn publish_unblocks_waiters_with_the_terminal_phase() {
        let cell = Arc::new(BarrierCell::pending(
            Task::default(),
            Arc::new(Gate::new(0)),
        ));
        assert!(cell.claim());

        let waiter_cell = Arc::clone(&cell);
        let waiter = std::thread::spawn(move || waiter_cell.wait_until_passable());

        cell.publish(BarrierPhase::Done);
        assert_eq!(waiter.join().unwrap(), BarrierPhase::Done);
    }

    #[test]
    fn root_barrier_is_immediately_passable() {
        let cell = BarrierCell::root();
        assert_eq!(cell.wait_until_passable(), BarrierPhase::Done);
    }
}
