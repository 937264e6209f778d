// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! In-band control events for the dispatcher. See [`ControlChannel`].

use mio::{Registry, Token, Waker};
use parking_lot::Mutex;
use std::io;

/// Control requests delivered through the kernel wait, in-band with I/O events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlEvent {
    /// Exit the dispatcher loop.
    Stop,
    /// No-op wake; makes the dispatcher re-evaluate timer deadlines.
    WakeUp,
}

/// Posted control events plus the waker that interrupts the kernel wait.
///
/// The kernel-side wake-up (a [`mio::Waker`]: eventfd on Linux, `EVFILT_USER` on
/// kqueue) carries no payload and coalesces, so the actual events ride in a
/// mutex-protected vector: post pushes then wakes, the dispatcher drains the
/// vector when the waker token surfaces.
pub(crate) struct ControlChannel {
    waker: Waker,
    pending: Mutex<Vec<ControlEvent>>,
}

impl ControlChannel {
    pub(crate) fn new(registry: &Registry, token: Token) -> io::Result<Self> {
        Ok(Self {
            waker: Waker::new(registry, token)?,
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Records `event` and interrupts the kernel wait.
    pub(crate) fn post(&self, event: ControlEvent) -> io::Result<()> {
        self.pending.lock().push(event);
        self.waker.wake()
    }

    /// Takes every posted event, oldest first.
    pub(crate) fn drain(&self) -> Vec<ControlEvent> {
        std::mem::take(&mut *self.pending.lock())
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
