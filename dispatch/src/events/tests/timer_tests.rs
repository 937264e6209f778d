// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

use crate::{events::EventManager, queue::ParallelQueue, test_fixtures::Counter,
            thread_pool::ThreadPool};
use std::{sync::Arc, time::Duration};

const WITHIN: Duration = Duration::from_secs(1);

fn harness() -> (ThreadPool, ParallelQueue, EventManager) {
    let pool = ThreadPool::builder()
        .max_workers(2)
        .max_idle_time(Duration::from_millis(200))
        .build();
    let queue = ParallelQueue::new(&pool);
    let manager = EventManager::new();
    manager.setup().expect("setup");
    manager.start_thread().expect("start dispatcher");
    (pool, queue, manager)
}

fn teardown(manager: &EventManager, pool: &ThreadPool) {
    manager.stop().expect("stop dispatcher");
    manager.join();
    pool.stop(true);
}

#[test]
fn one_shot_timer_fires_exactly_once() {
    let (pool, queue, manager) = harness();

    let firings = Arc::new(Counter::new());
    let firings_in_handler = Arc::clone(&firings);
    let _timer = manager
        .schedule_timer(Duration::from_millis(100), false, queue, move |_| {
            firings_in_handler.bump();
        })
        .expect("schedule timer");

    assert_eq!(firings.wait_at_least(1, WITHIN), 1);
    // Give a buggy re-arm a chance to show itself.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(firings.get(), 1);
    teardown(&manager, &pool);
}

#[test]
fn repeating_timer_fires_repeatedly() {
    let (pool, queue, manager) = harness();

    let firings = Arc::new(Counter::new());
    let firings_in_handler = Arc::clone(&firings);
    let _timer = manager
        .schedule_timer(Duration::from_millis(100), true, queue, move |_| {
            firings_in_handler.bump();
        })
        .expect("schedule timer");

    assert!(firings.wait_at_least(2, WITHIN) >= 2);
    teardown(&manager, &pool);
}

#[test]
fn faster_of_two_repeating_timers_fires_at_least_as_often() {
    let (pool, queue, manager) = harness();

    let slow = Arc::new(Counter::new());
    let fast = Arc::new(Counter::new());
    let slow_in_handler = Arc::clone(&slow);
    let fast_in_handler = Arc::clone(&fast);

    let _slow_timer = manager
        .schedule_timer(Duration::from_millis(200), true, queue.clone(), move |_| {
            slow_in_handler.bump();
        })
        .expect("schedule slow timer");
    let _fast_timer = manager
        .schedule_timer(Duration::from_millis(150), true, queue, move |_| {
            fast_in_handler.bump();
        })
        .expect("schedule fast timer");

    std::thread::sleep(WITHIN);
    let slow_count = slow.get();
    let fast_count = fast.get();
    assert!(slow_count >= 2, "slow timer fired {slow_count} times");
    assert!(fast_count >= 2, "fast timer fired {fast_count} times");
    assert!(fast_count >= slow_count);
    teardown(&manager, &pool);
}

#[test]
fn removed_timer_stops_firing() {
    let (pool, queue, manager) = harness();

    let firings = Arc::new(Counter::new());
    let firings_in_handler = Arc::clone(&firings);
    let timer = manager
        .schedule_timer(Duration::from_millis(50), true, queue, move |_| {
            firings_in_handler.bump();
        })
        .expect("schedule timer");

    assert!(firings.wait_at_least(1, WITHIN) >= 1);
    manager.remove_timer(&timer);
    // Idempotent.
    manager.remove_timer(&timer);

    let settled = firings.get();
    std::thread::sleep(Duration::from_millis(250));
    // One firing may already have been in flight when the timer was removed.
    assert!(firings.get() <= settled + 1);
    teardown(&manager, &pool);
}

#[test]
fn timer_scheduled_while_dispatcher_waits_indefinitely_still_fires() {
    // No timer is armed at start, so the dispatcher sits in an unbounded kernel
    // wait; the schedule must wake it up.
    let (pool, queue, manager) = harness();
    std::thread::sleep(Duration::from_millis(100));

    let firings = Arc::new(Counter::new());
    let firings_in_handler = Arc::clone(&firings);
    let _timer = manager
        .schedule_timer(Duration::from_millis(50), false, queue, move |_| {
            firings_in_handler.bump();
        })
        .expect("schedule timer");

    assert_eq!(firings.wait_at_least(1, WITHIN), 1);
    teardown(&manager, &pool);
}
