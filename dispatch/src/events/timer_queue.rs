// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Pending timers ordered by next deadline. See [`TimerQueue`].

use super::source::TimerSource;
use std::{cmp::Ordering,
          collections::BinaryHeap,
          sync::Arc,
          time::Instant};

/// Min-heap of pending timer firings.
///
/// The dispatcher peeks the soonest deadline to bound its kernel wait, pops
/// every expired entry after each wake-up, and re-inserts repeating timers at
/// `deadline + interval`. Removed timers stay in the heap until their next
/// expiry, at which point they are dropped (their source is unregistered).
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    /// Tie-breaker so equal deadlines pop in schedule order.
    next_seq: u64,
}

pub(crate) struct TimerEntry {
    pub(crate) deadline: Instant,
    seq: u64,
    pub(crate) source: Arc<TimerSource>,
}

impl TimerQueue {
    pub(crate) fn schedule(&mut self, deadline: Instant, source: Arc<TimerSource>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            seq,
            source,
        });
    }

    /// Soonest pending deadline, dropping entries whose source was removed.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if entry.source.is_registered() {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops the soonest entry if its deadline has passed.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<TimerEntry> {
        if self.heap.peek().is_some_and(|entry| entry.deadline <= now) {
            self.heap.pop()
        } else {
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize { self.heap.len() }
}

// BinaryHeap is a max-heap; order entries by reversed (deadline, seq) to pop the
// soonest first.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool { self.cmp(other) == Ordering::Equal }
}

impl Eq for TimerEntry {}

impl std::fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerQueue")
            .field("pending", &self.heap.len())
            .finish()
    }
}
