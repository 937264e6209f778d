// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words SIGUSR

use crate::{events::{EventManager, EventManagerError},
            queue::ParallelQueue,
            test_fixtures::Latch,
            thread_pool::ThreadPool};
use serial_test::serial;
use std::{os::fd::AsRawFd, sync::Arc, time::Duration};

/// Scenario timeout: generous so loaded CI machines do not flake.
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
fn write_end_of_a_fresh_pipe_is_immediately_writable() {
    let (pool, queue, manager) = harness();
    let (_read_end, write_end) = rustix::pipe::pipe().expect("pipe");

    let fired = Arc::new(Latch::new());
    let fired_in_handler = Arc::clone(&fired);
    let _source = manager
        .add_fd_write_source(write_end.as_raw_fd(), queue, move |_| {
            fired_in_handler.set();
        })
        .expect("add write source");

    // An empty pipe has buffer space, so the callback fires promptly.
    assert!(fired.wait_set(WITHIN));
    teardown(&manager, &pool);
}

#[test]
fn read_source_fires_after_a_byte_is_written() {
    let (pool, queue, manager) = harness();
    let (read_end, write_end) = rustix::pipe::pipe().expect("pipe");

    let fired = Arc::new(Latch::new());
    let fired_in_handler = Arc::clone(&fired);
    let _source = manager
        .add_fd_read_source(read_end.as_raw_fd(), queue, move |_| {
            fired_in_handler.set();
        })
        .expect("add read source");

    // Nothing to read yet; the source must stay quiet.
    assert!(!fired.wait_set(Duration::from_millis(100)));

    rustix::io::write(&write_end, b"\x01").expect("write one byte");
    assert!(fired.wait_set(WITHIN));
    teardown(&manager, &pool);
}

#[test]
#[serial]
fn signal_source_fires_when_the_signal_arrives() {
    let (pool, queue, manager) = harness();

    let fired = Arc::new(Latch::new());
    let fired_in_handler = Arc::clone(&fired);
    let _source = manager
        .add_signal_source(signal_hook::consts::SIGUSR1, queue, move |_| {
            fired_in_handler.set();
        })
        .expect("add signal source");

    signal_hook::low_level::raise(signal_hook::consts::SIGUSR1).expect("raise");
    assert!(fired.wait_set(WITHIN));
    teardown(&manager, &pool);
}

#[test]
fn disabled_source_is_silently_dropped() {
    let (pool, queue, manager) = harness();
    let (read_end, write_end) = rustix::pipe::pipe().expect("pipe");

    let fired = Arc::new(Latch::new());
    let fired_in_handler = Arc::clone(&fired);
    let source = manager
        .add_fd_read_source(read_end.as_raw_fd(), queue, move |_| {
            fired_in_handler.set();
        })
        .expect("add read source");

    source.set_enabled(false);
    rustix::io::write(&write_end, b"\x01").expect("write one byte");

    assert!(!fired.wait_set(Duration::from_millis(200)));
    teardown(&manager, &pool);
}

#[test]
fn removing_a_source_twice_is_a_no_op() {
    let (pool, queue, manager) = harness();
    let (read_end, write_end) = rustix::pipe::pipe().expect("pipe");

    let fired = Arc::new(Latch::new());
    let fired_in_handler = Arc::clone(&fired);
    let source = manager
        .add_fd_read_source(read_end.as_raw_fd(), queue, move |_| {
            fired_in_handler.set();
        })
        .expect("add read source");

    manager.remove_fd_source(&source).expect("first removal");
    manager
        .remove_fd_source(&source)
        .expect("second removal is a no-op");

    // The kernel listener is gone; a write must not reach the handler.
    rustix::io::write(&write_end, b"\x01").expect("write one byte");
    assert!(!fired.wait_set(Duration::from_millis(200)));

    // The caller's reference outlives removal.
    assert!(!source.is_enabled());
    teardown(&manager, &pool);
}

#[test]
fn two_sources_on_one_descriptor_both_fire() {
    let (pool, queue, manager) = harness();
    let (read_end, write_end) = rustix::pipe::pipe().expect("pipe");

    let first = Arc::new(Latch::new());
    let second = Arc::new(Latch::new());
    let first_in_handler = Arc::clone(&first);
    let second_in_handler = Arc::clone(&second);

    let _one = manager
        .add_fd_read_source(read_end.as_raw_fd(), queue.clone(), move |_| {
            first_in_handler.set();
        })
        .expect("add first source");
    let _two = manager
        .add_fd_read_source(read_end.as_raw_fd(), queue, move |_| {
            second_in_handler.set();
        })
        .expect("add second source");

    rustix::io::write(&write_end, b"\x01").expect("write one byte");
    assert!(first.wait_set(WITHIN));
    assert!(second.wait_set(WITHIN));
    teardown(&manager, &pool);
}

#[test]
fn operations_before_setup_are_rejected() {
    let pool = ThreadPool::builder().max_workers(1).build();
    let queue = ParallelQueue::new(&pool);
    let manager = EventManager::new();

    assert!(matches!(
        manager.add_fd_read_source(0, queue, |_| {}),
        Err(EventManagerError::NotSetUp)
    ));
    assert!(matches!(manager.stop(), Err(EventManagerError::NotSetUp)));
    assert!(matches!(
        manager.start_thread(),
        Err(EventManagerError::NotSetUp)
    ));
    pool.stop(true);
}

#[test]
fn double_setup_is_rejected() {
    let manager = EventManager::new();
    manager.setup().expect("first setup");
    assert!(matches!(
        manager.setup(),
        Err(EventManagerError::AlreadySetUp)
    ));
}

#[test]
fn stop_terminates_the_dispatcher_thread() {
    let (pool, _queue, manager) = harness();
    manager.stop().expect("stop");
    manager.join();

    // The kernel handle was consumed by the finished dispatcher.
    assert!(matches!(
        manager.run(),
        Err(EventManagerError::AlreadyRunning)
    ));
    pool.stop(true);
}
