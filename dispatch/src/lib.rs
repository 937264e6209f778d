// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue biodispatch libdispatch

//! # biodispatch
//!
//! A userland concurrency and I/O dispatch core in the style of `libdispatch`:
//! a cooperative thread pool, typed work queues, movable one-shot tasks, a
//! kernel-event manager, and a subprocess launcher that share one control-flow
//! and failure model.
//!
//! | Component        | Role                                                          |
//! | :--------------- | :------------------------------------------------------------ |
//! | [`Task`]         | Type-erased, movable-only callable; runs at most once         |
//! | [`Group`]        | Counting barrier for fan-out/join                             |
//! | [`SerialQueue`]  | Strict FIFO, at-most-one task executing                       |
//! | [`ParallelQueue`]| Unordered bag; optional serialising barriers                  |
//! | [`ThreadPool`]   | Dynamic worker set draining the queues                        |
//! | [`EventManager`] | fd/signal/timer events translated into task submissions       |
//! | [`Subprocess`]   | Pipe-wired child processes with structured failure records    |
//!
//! Control flow: callers wrap work in tasks and submit them to queues; queues
//! notify the pool; workers drain queues round-robin. The event manager runs a
//! single dispatcher thread in the kernel wait (epoll on Linux, kqueue on
//! macOS/BSD, selected at build time via `mio`) and converts readiness into
//! task submissions on whatever queue each source is bound to.
//!
//! ## Example
//!
//! ```
//! use biodispatch::{Group, ParallelQueue, SerialQueue, Task, TaskQueue, ThreadPool};
//!
//! let pool = ThreadPool::default();
//! let background = ParallelQueue::new(&pool);
//! let writer = SerialQueue::new(&pool);
//!
//! // Fan out, funnel results into a serial queue, join.
//! let group = Group::new();
//! for chunk in 0..4 {
//!     let writer = writer.clone();
//!     background.group_spawn(
//!         &group,
//!         Task::new(move || {
//!             let digest = chunk * 10; // Stand-in for real work.
//!             writer.spawn(Task::new(move || {
//!                 let _ = digest; // Serialised: no lock needed here.
//!             }));
//!         }),
//!     );
//! }
//! group.wait();
//! pool.stop(true);
//! ```
//!
//! ## Platform
//!
//! Unix only: the event manager rests on `mio`'s epoll/kqueue backends plus
//! `signal-hook` for signal delivery, and the subprocess module speaks POSIX
//! process semantics.

// Attach.
pub mod events;
pub mod group;
pub mod queue;
pub mod subprocess;
pub mod task;
pub mod thread_pool;

#[cfg(test)]
pub(crate) mod test_fixtures;

// Re-export.
pub use events::{Direction, EventManager, EventManagerError, FdSource, SignalSource,
                 TimerSource};
pub use group::Group;
pub use queue::{ParallelQueue, SerialQueue, TaskQueue};
pub use subprocess::{CloseKind, CloseOutcome, CommandLineError, HandleSpec,
                     SpawnFailure, SpawnPhase, Subprocess, parse_command_arguments};
pub use task::Task;
pub use thread_pool::{ThreadPool, ThreadPoolBuilder};
