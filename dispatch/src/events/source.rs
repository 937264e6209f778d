// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Event sources: registered interests in kernel events. See [`FdSource`],
//! [`SignalSource`] and [`TimerSource`].

use crate::{queue::TaskQueue, task::Task};
use std::{fmt,
          os::fd::RawFd,
          sync::{Arc, Weak,
                 atomic::{AtomicBool, Ordering}},
          time::Duration};

/// Whether an [`FdSource`] watches for readability or writability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Every source fires by minting a fresh one-shot [`Task`] around its shared
/// handler and submitting it to the source's queue. The handler receives the
/// source itself, so a callback can disable or inspect the source it belongs to.
///
/// Sources are shared: the event manager keeps one strong reference until the
/// source is removed, the caller holds another. A disabled source that fires is
/// silently dropped; tasks already submitted still run.
macro_rules! common_source_methods {
    ($source:ident) => {
        impl $source {
            /// Sources fire only while enabled. Disabling is atomic and takes
            /// effect for every firing that has not yet been dispatched.
            pub fn set_enabled(&self, enabled: bool) {
                self.enabled.store(enabled, Ordering::Release);
            }

            #[must_use]
            pub fn is_enabled(&self) -> bool { self.enabled.load(Ordering::Acquire) }

            /// Submits the handler to the bound queue, unless the source is
            /// disabled.
            pub(crate) fn fire_if_enabled(&self) {
                if !self.is_enabled() {
                    return;
                }
                // Sources are only ever constructed behind an Arc (see
                // `create()`), so the upgrade cannot fail while the manager or
                // the caller holds the source.
                let Some(source) = self.me.upgrade() else { return };
                let handler = Arc::clone(&self.handler);
                self.queue.spawn(Task::new(move || (*handler)(&source)));
            }
        }
    };
}

/// A registered interest in a file descriptor becoming readable or writable.
///
/// Delivery is edge-style and at-least-once: readiness transitions that occur
/// while an earlier firing is still pending may be coalesced into one callback,
/// so the handler must drain the descriptor rather than count callbacks.
pub struct FdSource {
    fd: RawFd,
    direction: Direction,
    enabled: AtomicBool,
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn Fn(&FdSource) + Send + Sync>,
    /// Self-reference handed to the transient tasks a firing submits.
    me: Weak<FdSource>,
}

impl FdSource {
    pub(crate) fn create(
        fd: RawFd,
        direction: Direction,
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn Fn(&FdSource) + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            fd,
            direction,
            enabled: AtomicBool::new(true),
            queue,
            handler,
            me: me.clone(),
        })
    }

    #[must_use]
    pub fn fd(&self) -> RawFd { self.fd }

    #[must_use]
    pub fn direction(&self) -> Direction { self.direction }
}

common_source_methods!(FdSource);

/// A registered interest in a POSIX signal.
pub struct SignalSource {
    signal: i32,
    enabled: AtomicBool,
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn Fn(&SignalSource) + Send + Sync>,
    me: Weak<SignalSource>,
}

impl SignalSource {
    pub(crate) fn create(
        signal: i32,
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn Fn(&SignalSource) + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            signal,
            enabled: AtomicBool::new(true),
            queue,
            handler,
            me: me.clone(),
        })
    }

    #[must_use]
    pub fn signal(&self) -> i32 { self.signal }
}

common_source_methods!(SignalSource);

/// A one-shot or repeating timer.
///
/// Deadlines are monotonic-clock instants. A repeating timer re-arms at
/// `deadline + interval` rather than `now + interval`, so scheduling latency does
/// not accumulate into drift.
pub struct TimerSource {
    interval: Duration,
    repeats: bool,
    enabled: AtomicBool,
    /// Cleared when the timer is removed (or a one-shot timer has fired); the
    /// timer queue drops unregistered entries on expiry.
    registered: AtomicBool,
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn Fn(&TimerSource) + Send + Sync>,
    me: Weak<TimerSource>,
}

impl TimerSource {
    pub(crate) fn create(
        interval: Duration,
        repeats: bool,
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn Fn(&TimerSource) + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            interval,
            repeats,
            enabled: AtomicBool::new(true),
            registered: AtomicBool::new(true),
            queue,
            handler,
            me: me.clone(),
        })
    }

    #[must_use]
    pub fn interval(&self) -> Duration { self.interval }

    #[must_use]
    pub fn repeats(&self) -> bool { self.repeats }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unregistered(&self) {
        self.registered.store(false, Ordering::Release);
    }
}

common_source_methods!(TimerSource);

impl fmt::Debug for FdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdSource")
            .field("fd", &self.fd)
            .field("direction", &self.direction)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl fmt::Debug for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSource")
            .field("signal", &self.signal)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl fmt::Debug for TimerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerSource")
            .field("interval", &self.interval)
            .field("repeats", &self.repeats)
            .field("enabled", &self.is_enabled())
            .field("registered", &self.is_registered())
            .finish()
    }
}
