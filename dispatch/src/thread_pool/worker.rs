// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The worker thread loop. See [`run`].

use super::ThreadPool;
use crate::queue::{QueueItem, RegularItem};
use std::{panic::{AssertUnwindSafe, catch_unwind},
          time::Instant};

#[cfg(feature = "barrier")]
use crate::queue::barrier::BarrierPhase;

/// What a worker does after handling one queue item.
enum Flow {
    Continue,
    /// A barrier stopped the pool; this worker terminates.
    #[cfg_attr(not(feature = "barrier"), allow(dead_code))]
    Exit,
}

/// The worker loop. One invocation per worker thread; returns when the worker
/// removes itself from the pool.
///
/// Each iteration has three stages, mirroring the pool contract:
///
/// 1. **Drain.** Under a read lock on the queue registry (so queues cannot
///    disappear mid-pass), visit every queue round-robin, taking one item per
///    queue per pass, until a full pass yields nothing.
/// 2. **Idle check.** If the drain executed nothing and `max_idle_time` has
///    passed since the last productive wake-up, remove this worker - unless that
///    would drop the pool below `min_workers`.
/// 3. **Sleep.** Mark idle and wait on the pool condition variable, consuming one
///    notification on wake-up. Spurious wake-ups loop; a timed-out wait removes
///    the worker (again honouring `min_workers`); a stopped pool always removes
///    it.
pub(crate) fn run(pool: &ThreadPool) {
    tracing::debug!("pool worker started");
    let inner = &pool.inner;
    let mut last_productive_wake = Instant::now();

    loop {
        // Total over the passes of the drain stage below.
        let mut executed: i64 = 0;
        let mut stop_requested = false;
        let mut saw_dead_queue = false;

        {
            // The read lock keeps registered queues alive while their tasks
            // execute; registration (write) waits for the pass to finish.
            let queues = inner.queues.read();
            'drain: loop {
                let before = executed;
                for slot in queues.iter() {
                    let Some(queue) = slot.upgrade() else {
                        saw_dead_queue = true;
                        continue;
                    };
                    let Some(item) = queue.try_dequeue() else { continue };
                    executed += 1;
                    match run_item(pool, item) {
                        Flow::Continue => {}
                        Flow::Exit => {
                            stop_requested = true;
                            break 'drain;
                        }
                    }
                }
                if executed == before {
                    break;
                }
            }
        }

        // Dropped queues leave dead weak entries behind; forget them now that
        // the read lock is released.
        if saw_dead_queue {
            pool.prune_queues();
        }

        if stop_requested {
            let mut state = inner.state.lock();
            state.waiting_tasks -= executed;
            inner.remove_worker_locked(&mut state);
            tracing::debug!("pool worker exiting: barrier stop");
            return;
        }

        // Idle-time check: an unproductive wake-up after a full idle period ends
        // this worker.
        let now = Instant::now();
        if executed == 0 && inner.config.max_idle_time <= now - last_productive_wake {
            let mut state = inner.state.lock();
            if state.current_workers > inner.config.min_workers || !state.should_continue
            {
                inner.remove_worker_locked(&mut state);
                tracing::debug!("pool worker exiting: idle timeout");
                return;
            }
        }
        last_productive_wake = now;

        let mut state = inner.state.lock();
        state.waiting_tasks -= executed;
        state.idle_workers += 1;
        loop {
            let timed_out = inner
                .cv
                .wait_for(&mut state, inner.config.max_idle_time)
                .timed_out();

            if !state.should_continue {
                // A notify may have raced the stop and already converted this
                // worker's idle mark into a notification; consume whichever
                // mark is ours so the counters stay balanced.
                if state.notified_workers > 0 {
                    state.notified_workers -= 1;
                } else {
                    state.idle_workers -= 1;
                }
                inner.remove_worker_locked(&mut state);
                tracing::debug!("pool worker exiting: pool stopped");
                return;
            }

            // Check notifications before the timeout: a notify that lands at
            // the deadline must win, or its wake-up would be lost.
            if state.notified_workers > 0 {
                state.notified_workers -= 1;
                break;
            }

            if timed_out {
                if state.current_workers > inner.config.min_workers {
                    state.idle_workers -= 1;
                    inner.remove_worker_locked(&mut state);
                    tracing::debug!("pool worker exiting: idle timeout");
                    return;
                }
                // At the floor: stay idle and keep waiting.
            }
            // Spurious wake-up: wait again.
        }
        drop(state);
    }
}

#[cfg_attr(not(feature = "barrier"), allow(unused_variables))]
fn run_item(pool: &ThreadPool, item: QueueItem) -> Flow {
    match item {
        QueueItem::Regular(item) => run_regular(item),
        #[cfg(feature = "barrier")]
        QueueItem::Barrier(cell) => run_barrier(pool, &cell),
    }
}

fn run_regular(item: RegularItem) -> Flow {
    #[cfg(feature = "barrier")]
    {
        if let Some(cell) = &item.barrier {
            if cell.wait_until_passable() == BarrierPhase::DoStop {
                // The barrier's callable stopped the pool; the undequeued task is
                // dropped and this worker terminates.
                return Flow::Exit;
            }
        }
    }

    #[cfg(feature = "barrier")]
    let barrier = item.barrier.clone();
    let RegularItem {
        task,
        group,
        serial,
        ..
    } = item;

    run_user_task(task);

    #[cfg(feature = "barrier")]
    if let Some(cell) = barrier {
        cell.successor_gate().arrive();
    }
    // Exit the group only after the task ran: the task may add more work to it.
    if let Some(group) = group {
        group.exit();
    }
    if let Some(serial) = serial {
        serial.finish_one();
    }
    Flow::Continue
}

#[cfg(feature = "barrier")]
fn run_barrier(pool: &ThreadPool, cell: &crate::queue::barrier::BarrierCell) -> Flow {
    if cell.claim() {
        // Everything submitted before the barrier must finish first.
        cell.wait_for_prefix();
        run_user_task(cell.take_task());

        let should_continue = pool.inner.state.lock().should_continue;
        if should_continue {
            cell.publish(BarrierPhase::Done);
            Flow::Continue
        } else {
            // The callable requested shutdown: release every waiter into
            // termination, then terminate ourselves.
            cell.publish(BarrierPhase::DoStop);
            Flow::Exit
        }
    } else {
        // The barrier item is unique, so a failed claim means another worker beat
        // us to a duplicate delivery - wait it out like a gated task would.
        match cell.wait_until_passable() {
            BarrierPhase::DoStop => Flow::Exit,
            BarrierPhase::Done => Flow::Continue,
            BarrierPhase::NotExecuted | BarrierPhase::Executing => unreachable!(),
        }
    }
}

fn run_user_task(task: crate::task::Task) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.run())) {
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .map(String::from)
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".into());
        tracing::error!(panic = %message, "task panicked; worker continues");
    }
}
