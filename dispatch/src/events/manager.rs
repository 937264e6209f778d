// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words signalfd eventfd timerfd kqueue epoll

//! Kernel-event multiplexer with a single dispatcher thread. See [`EventManager`].

use super::{control::{ControlChannel, ControlEvent},
            source::{Direction, FdSource, SignalSource, TimerSource},
            timer_queue::TimerQueue};
use crate::queue::TaskQueue;
use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use parking_lot::Mutex;
use signal_hook_mio::v1_0::Signals;
use smallvec::SmallVec;
use std::{collections::HashMap,
          io,
          os::fd::RawFd,
          sync::{Arc, OnceLock},
          thread::JoinHandle,
          time::Instant};

/// Token reserved for the control-event waker. Well above any file descriptor
/// (fd tokens are the fd value itself).
const WAKER_TOKEN: Token = Token(usize::MAX - 1);
/// Token reserved for the shared signal receiver.
const SIGNALS_TOKEN: Token = Token(usize::MAX - 2);
/// Size of the kernel event batch per wait.
const EVENT_BATCH: usize = 16;

/// Translates kernel events - file-descriptor readiness, signals, timer
/// expirations - into task submissions on user-chosen queues.
///
/// One dedicated dispatcher thread blocks in the kernel wait
/// ([`mio::Poll::poll`]: epoll on Linux, kqueue on macOS/BSD - the platform
/// backend is selected at build time by `mio`). Every other operation
/// (registration, removal, stop) may be called from any thread; registration
/// goes through a cloned [`mio::Registry`] and the in-memory source registry is
/// guarded by one mutex, under which all kernel interest changes happen.
///
/// # Lifecycle
///
/// ```
/// use biodispatch::{EventManager, ParallelQueue, ThreadPool};
///
/// let pool = ThreadPool::default();
/// let _queue = ParallelQueue::new(&pool);
/// let manager = EventManager::new();
/// manager.setup()?;
/// manager.start_thread()?;
/// // ... add sources, schedule timers ...
/// manager.stop()?;
/// manager.join();
/// pool.stop(true);
/// # Ok::<(), biodispatch::EventManagerError>(())
/// ```
///
/// [`setup()`] must be called exactly once before anything else; [`stop()`]
/// posts an in-band control event, so the dispatcher exits after finishing the
/// kernel wake-up it is currently processing. Tasks already submitted to queues
/// run to completion regardless.
///
/// # Delivery contract
///
/// Sources promise at-least-once delivery with level semantics: events sharing a
/// kernel identity that fire during one wake-up may be coalesced into a single
/// callback, so fd handlers must drain their descriptor. Within one source,
/// callbacks do not overlap only if the source is bound to a serial queue.
///
/// # Add/remove semantics
///
/// Adding the first source for a descriptor registers the kernel listener;
/// further sources for the same descriptor join the in-memory registry, and the
/// kernel interest set only changes when a descriptor gains or loses its last
/// reader or writer. Removal is the converse and is idempotent: removing a
/// source twice is a no-op. Signals share a single kernel-side receiver that
/// grows as signals are subscribed.
///
/// Cloning the handle is cheap and yields the same manager.
///
/// [`setup()`]: Self::setup
/// [`stop()`]: Self::stop
#[derive(Clone)]
pub struct EventManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    /// Present between `setup()` and `run()`; the dispatcher owns it afterwards.
    poll: Mutex<Option<Poll>>,
    control: OnceLock<ControlChannel>,
    registry: Mutex<SourceRegistry>,
    timers: Mutex<TimerQueue>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Registered sources plus the kernel registration handle. One mutex guards the
/// lot; the kernel interest set is only modified while it is held.
#[derive(Default)]
struct SourceRegistry {
    /// Cross-thread registration handle cloned from the poll at setup.
    kernel: Option<mio::Registry>,
    by_key: HashMap<SourceKey, Vec<SourceRef>>,
    fd_interests: HashMap<RawFd, FdInterestCount>,
    /// Shared receiver for every subscribed signal, registered at
    /// [`SIGNALS_TOKEN`].
    signals: Option<Signals>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SourceKey {
    Fd(RawFd),
    Signal(i32),
}

enum SourceRef {
    Fd(Arc<FdSource>),
    Signal(Arc<SignalSource>),
}

/// Readers/writers currently registered for one descriptor. The kernel interest
/// set changes only when one of the counts crosses zero.
#[derive(Debug, Default, Clone, Copy)]
struct FdInterestCount {
    readers: usize,
    writers: usize,
}

impl FdInterestCount {
    fn interest(self) -> Option<Interest> {
        match (self.readers > 0, self.writers > 0) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Failures surfaced by [`EventManager`]. Setup and registration errors are
/// retryable resource problems; the `NotSetUp` / `AlreadySetUp` /
/// `AlreadyRunning` variants are call-order violations.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum EventManagerError {
    /// [`EventManager::setup`] was called twice.
    #[error("event manager is already set up")]
    #[diagnostic(code(biodispatch::events::already_set_up))]
    AlreadySetUp,

    /// An operation that requires [`EventManager::setup`] ran before it.
    #[error("event manager has not been set up")]
    #[diagnostic(
        code(biodispatch::events::not_set_up),
        help("Call setup() before adding sources, scheduling timers or running.")
    )]
    NotSetUp,

    /// [`EventManager::run`] (or the dispatcher thread) is already consuming
    /// the kernel handle.
    #[error("event dispatcher is already running (or has finished)")]
    #[diagnostic(code(biodispatch::events::already_running))]
    AlreadyRunning,

    /// Creating the kernel event handle or its helper objects failed.
    #[error("failed to create the kernel event handle")]
    #[diagnostic(
        code(biodispatch::events::setup),
        help("Check file descriptor limits (`ulimit -n`).")
    )]
    Setup(#[source] io::Error),

    /// Changing the kernel interest set failed.
    #[error("failed to register an event source with the kernel handle")]
    #[diagnostic(code(biodispatch::events::register))]
    Register(#[source] io::Error),

    /// The kernel wait itself failed; the dispatcher loop has terminated.
    #[error("kernel event wait failed")]
    #[diagnostic(code(biodispatch::events::wait))]
    Wait(#[source] io::Error),

    /// Posting a control event (stop or wake-up) failed.
    #[error("failed to post a control event to the dispatcher")]
    #[diagnostic(code(biodispatch::events::wake))]
    Wake(#[source] io::Error),

    /// Spawning the dispatcher thread failed.
    #[error("failed to spawn the event dispatcher thread")]
    #[diagnostic(code(biodispatch::events::thread_spawn))]
    ThreadSpawn(#[source] io::Error),
}

impl EventManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                poll: Mutex::new(None),
                control: OnceLock::new(),
                registry: Mutex::new(SourceRegistry::default()),
                timers: Mutex::new(TimerQueue::default()),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Creates the kernel event handle, the control waker and the cross-thread
    /// registration handle. Must be called exactly once, before any `add_*`,
    /// [`schedule_timer`](Self::schedule_timer), [`run`](Self::run) or
    /// [`stop`](Self::stop).
    ///
    /// # Errors
    ///
    /// [`EventManagerError::AlreadySetUp`] on a second call;
    /// [`EventManagerError::Setup`] when the OS refuses a resource.
    pub fn setup(&self) -> Result<(), EventManagerError> {
        let mut poll_slot = self.inner.poll.lock();
        if poll_slot.is_some() || self.inner.control.get().is_some() {
            return Err(EventManagerError::AlreadySetUp);
        }

        let poll = Poll::new().map_err(EventManagerError::Setup)?;
        let control = ControlChannel::new(poll.registry(), WAKER_TOKEN)
            .map_err(EventManagerError::Setup)?;
        let kernel = poll
            .registry()
            .try_clone()
            .map_err(EventManagerError::Setup)?;

        self.inner.registry.lock().kernel = Some(kernel);
        self.inner
            .control
            .set(control)
            .unwrap_or_else(|_| unreachable!("checked above under the poll lock"));
        *poll_slot = Some(poll);
        Ok(())
    }

    /// Spawns the dispatcher thread (named `dispatch-events`) and returns
    /// immediately. Use [`stop`](Self::stop) + [`join`](Self::join) to shut it
    /// down.
    ///
    /// # Errors
    ///
    /// [`EventManagerError::NotSetUp`] before [`setup`](Self::setup);
    /// [`EventManagerError::AlreadyRunning`] if a dispatcher was already
    /// started; [`EventManagerError::ThreadSpawn`] if the OS refuses a thread.
    pub fn start_thread(&self) -> Result<(), EventManagerError> {
        if self.inner.control.get().is_none() {
            return Err(EventManagerError::NotSetUp);
        }
        let mut dispatcher = self.inner.dispatcher.lock();
        if dispatcher.is_some() {
            return Err(EventManagerError::AlreadyRunning);
        }

        let manager = self.clone();
        let handle = std::thread::Builder::new()
            .name("dispatch-events".into())
            .spawn(move || {
                if let Err(error) = manager.run() {
                    tracing::error!(%error, "event dispatcher terminated with an error");
                }
            })
            .map_err(EventManagerError::ThreadSpawn)?;
        *dispatcher = Some(handle);
        Ok(())
    }

    /// The dispatcher loop. Blocks the calling thread until [`stop`](Self::stop)
    /// is observed or the kernel wait fails. Normally invoked via
    /// [`start_thread`](Self::start_thread); call directly to donate the current
    /// thread instead.
    ///
    /// # Errors
    ///
    /// [`EventManagerError::Wait`] if the kernel wait fails - the loop
    /// terminates rather than silently leaking kernel resources. Call-order
    /// violations surface as [`EventManagerError::NotSetUp`] /
    /// [`EventManagerError::AlreadyRunning`].
    pub fn run(&self) -> Result<(), EventManagerError> {
        let mut poll = {
            self.inner.poll.lock().take().ok_or_else(|| {
                if self.inner.control.get().is_none() {
                    EventManagerError::NotSetUp
                } else {
                    EventManagerError::AlreadyRunning
                }
            })?
        };
        let control = self
            .inner
            .control
            .get()
            .unwrap_or_else(|| unreachable!("poll implies control, both set in setup"));

        let mut events = Events::with_capacity(EVENT_BATCH);
        tracing::debug!("event dispatcher running");
        loop {
            // Wait indefinitely unless a timer is armed.
            let timeout = self
                .inner
                .timers
                .lock()
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));

            if let Err(error) = poll.poll(&mut events, timeout) {
                if error.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(EventManagerError::Wait(error));
            }

            // Control events first: a stop posted before this wake-up must win
            // over the I/O events delivered alongside it.
            let mut stop_requested = false;
            for event in &events {
                if event.token() == WAKER_TOKEN {
                    for control_event in control.drain() {
                        match control_event {
                            ControlEvent::Stop => stop_requested = true,
                            // Wake-ups exist to re-evaluate timer deadlines; the
                            // timeout computation above already did.
                            ControlEvent::WakeUp => {}
                        }
                    }
                }
            }
            if stop_requested {
                tracing::debug!("event dispatcher stopping");
                return Ok(());
            }

            for event in &events {
                match event.token() {
                    WAKER_TOKEN => {}
                    SIGNALS_TOKEN => self.dispatch_signals(),
                    token => self.dispatch_fd(
                        token.0 as RawFd,
                        event.is_readable(),
                        event.is_writable(),
                    ),
                }
            }

            self.check_timers();
        }
    }

    /// Requests orderly shutdown: the dispatcher exits once it dequeues the
    /// control event. Pending tasks already submitted to queues still run.
    ///
    /// # Errors
    ///
    /// [`EventManagerError::NotSetUp`] before [`setup`](Self::setup);
    /// [`EventManagerError::Wake`] if the wake-up write fails.
    pub fn stop(&self) -> Result<(), EventManagerError> {
        self.inner
            .control
            .get()
            .ok_or(EventManagerError::NotSetUp)?
            .post(ControlEvent::Stop)
            .map_err(EventManagerError::Wake)
    }

    /// Waits for the dispatcher thread started by
    /// [`start_thread`](Self::start_thread) to exit. No-op if none is running.
    pub fn join(&self) {
        let handle = self.inner.dispatcher.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("event dispatcher thread panicked");
            }
        }
    }

    /// Watches `fd` for readability. The handler runs on `queue` each time the
    /// kernel reports the descriptor readable; it must drain the descriptor
    /// (delivery is edge-style).
    ///
    /// # Errors
    ///
    /// [`EventManagerError::NotSetUp`] before [`setup`](Self::setup);
    /// [`EventManagerError::Register`] if the kernel interest change fails.
    pub fn add_fd_read_source(
        &self,
        fd: RawFd,
        queue: impl TaskQueue + 'static,
        handler: impl Fn(&FdSource) + Send + Sync + 'static,
    ) -> Result<Arc<FdSource>, EventManagerError> {
        self.add_fd_source(fd, Direction::Read, Arc::new(queue), Arc::new(handler))
    }

    /// Watches `fd` for writability. See
    /// [`add_fd_read_source`](Self::add_fd_read_source).
    ///
    /// # Errors
    ///
    /// Same as [`add_fd_read_source`](Self::add_fd_read_source).
    pub fn add_fd_write_source(
        &self,
        fd: RawFd,
        queue: impl TaskQueue + 'static,
        handler: impl Fn(&FdSource) + Send + Sync + 'static,
    ) -> Result<Arc<FdSource>, EventManagerError> {
        self.add_fd_source(fd, Direction::Write, Arc::new(queue), Arc::new(handler))
    }

    fn add_fd_source(
        &self,
        fd: RawFd,
        direction: Direction,
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn Fn(&FdSource) + Send + Sync>,
    ) -> Result<Arc<FdSource>, EventManagerError> {
        let source = FdSource::create(fd, direction, queue, handler);

        let mut registry = self.inner.registry.lock();
        let registry = &mut *registry;
        let kernel = registry.kernel.as_ref().ok_or(EventManagerError::NotSetUp)?;

        let counts = registry.fd_interests.entry(fd).or_default();
        let mut updated = *counts;
        match direction {
            Direction::Read => updated.readers += 1,
            Direction::Write => updated.writers += 1,
        }

        // The kernel listener changes only when the descriptor gains its first
        // reader/writer.
        if updated.interest() != counts.interest() {
            let interest = updated
                .interest()
                .unwrap_or_else(|| unreachable!("a count was just incremented"));
            let result = if counts.interest().is_none() {
                kernel.register(&mut SourceFd(&fd), Token(fd as usize), interest)
            } else {
                kernel.reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
            };
            result.map_err(EventManagerError::Register)?;
        }
        *counts = updated;

        registry
            .by_key
            .entry(SourceKey::Fd(fd))
            .or_default()
            .push(SourceRef::Fd(Arc::clone(&source)));
        Ok(source)
    }

    /// Removes `source`, disabling it and releasing the manager's reference.
    /// The kernel listener is unregistered when the descriptor loses its last
    /// reader/writer. Removing a source twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`EventManagerError::Register`] if the kernel interest change fails.
    pub fn remove_fd_source(
        &self,
        source: &Arc<FdSource>,
    ) -> Result<(), EventManagerError> {
        let fd = source.fd();
        let mut registry = self.inner.registry.lock();
        let registry = &mut *registry;

        let Some(sources) = registry.by_key.get_mut(&SourceKey::Fd(fd)) else {
            return Ok(());
        };
        let Some(position) = sources.iter().position(|existing| {
            matches!(existing, SourceRef::Fd(fd_source) if Arc::ptr_eq(fd_source, source))
        }) else {
            return Ok(());
        };

        source.set_enabled(false);
        sources.remove(position);
        if sources.is_empty() {
            registry.by_key.remove(&SourceKey::Fd(fd));
        }

        let Some(counts) = registry.fd_interests.get_mut(&fd) else {
            return Ok(());
        };
        let mut updated = *counts;
        match source.direction() {
            Direction::Read => updated.readers = updated.readers.saturating_sub(1),
            Direction::Write => updated.writers = updated.writers.saturating_sub(1),
        }

        if updated.interest() != counts.interest() {
            let kernel = registry.kernel.as_ref().ok_or(EventManagerError::NotSetUp)?;
            let result = match updated.interest() {
                // No listeners left for the descriptor.
                None => kernel.deregister(&mut SourceFd(&fd)),
                Some(interest) => {
                    kernel.reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
                }
            };
            result.map_err(EventManagerError::Register)?;
        }

        if updated.interest().is_none() {
            registry.fd_interests.remove(&fd);
        } else {
            *counts = updated;
        }
        Ok(())
    }

    /// Watches for `signal` (e.g. `signal_hook::consts::SIGUSR1`). All
    /// subscribed signals share one kernel-side receiver; the first subscription
    /// creates and registers it.
    ///
    /// # Errors
    ///
    /// [`EventManagerError::NotSetUp`] before [`setup`](Self::setup);
    /// [`EventManagerError::Register`] if the signal cannot be subscribed
    /// (e.g. `SIGKILL`).
    pub fn add_signal_source(
        &self,
        signal: i32,
        queue: impl TaskQueue + 'static,
        handler: impl Fn(&SignalSource) + Send + Sync + 'static,
    ) -> Result<Arc<SignalSource>, EventManagerError> {
        let source = SignalSource::create(signal, Arc::new(queue), Arc::new(handler));

        let mut registry = self.inner.registry.lock();
        let registry = &mut *registry;
        let kernel = registry.kernel.as_ref().ok_or(EventManagerError::NotSetUp)?;

        match registry.signals.as_ref() {
            Some(signals) => {
                signals
                    .add_signal(signal)
                    .map_err(EventManagerError::Register)?;
            }
            None => {
                let mut signals =
                    Signals::new([signal]).map_err(EventManagerError::Register)?;
                kernel
                    .register(&mut signals, SIGNALS_TOKEN, Interest::READABLE)
                    .map_err(EventManagerError::Register)?;
                registry.signals = Some(signals);
            }
        }

        registry
            .by_key
            .entry(SourceKey::Signal(signal))
            .or_default()
            .push(SourceRef::Signal(Arc::clone(&source)));
        Ok(source)
    }

    /// Removes `source`, disabling it and releasing the manager's reference.
    /// Removing a source twice is a no-op. The shared signal receiver keeps the
    /// signal subscribed at the kernel level; deliveries without a registered
    /// source are silently dropped.
    pub fn remove_signal_source(&self, source: &Arc<SignalSource>) {
        let mut registry = self.inner.registry.lock();
        let key = SourceKey::Signal(source.signal());
        let Some(sources) = registry.by_key.get_mut(&key) else {
            return;
        };
        let Some(position) = sources.iter().position(|existing| {
            matches!(existing, SourceRef::Signal(signal_source) if Arc::ptr_eq(signal_source, source))
        }) else {
            return;
        };

        source.set_enabled(false);
        sources.remove(position);
        if sources.is_empty() {
            registry.by_key.remove(&key);
        }
    }

    /// Schedules a timer that fires `interval` from now, and - when `repeats` -
    /// every `interval` after that, drift-free (each deadline is the previous
    /// deadline plus `interval`).
    ///
    /// # Errors
    ///
    /// [`EventManagerError::NotSetUp`] before [`setup`](Self::setup);
    /// [`EventManagerError::Wake`] if the dispatcher cannot be nudged to pick
    /// up the new deadline.
    pub fn schedule_timer(
        &self,
        interval: std::time::Duration,
        repeats: bool,
        queue: impl TaskQueue + 'static,
        handler: impl Fn(&TimerSource) + Send + Sync + 'static,
    ) -> Result<Arc<TimerSource>, EventManagerError> {
        let control = self
            .inner
            .control
            .get()
            .ok_or(EventManagerError::NotSetUp)?;

        let source = TimerSource::create(interval, repeats, Arc::new(queue), Arc::new(handler));
        self.inner
            .timers
            .lock()
            .schedule(Instant::now() + interval, Arc::clone(&source));

        // The dispatcher may be blocked with a longer (or no) timeout; make it
        // re-evaluate deadlines.
        control
            .post(ControlEvent::WakeUp)
            .map_err(EventManagerError::Wake)?;
        Ok(source)
    }

    /// Cancels a timer: it is disabled immediately and its pending heap entry
    /// is dropped on its next expiry. Removing a timer twice is a no-op.
    pub fn remove_timer(&self, source: &Arc<TimerSource>) {
        source.set_enabled(false);
        source.mark_unregistered();
    }

    fn dispatch_fd(&self, fd: RawFd, readable: bool, writable: bool) {
        let registry = self.inner.registry.lock();
        let Some(sources) = registry.by_key.get(&SourceKey::Fd(fd)) else {
            return;
        };
        for source in sources {
            if let SourceRef::Fd(fd_source) = source {
                let wants = match fd_source.direction() {
                    Direction::Read => readable,
                    Direction::Write => writable,
                };
                if wants {
                    fd_source.fire_if_enabled();
                }
            }
        }
    }

    fn dispatch_signals(&self) {
        let mut registry = self.inner.registry.lock();
        let registry = &mut *registry;
        let Some(signals) = registry.signals.as_mut() else {
            return;
        };

        let pending: SmallVec<[i32; 8]> = signals.pending().collect();
        for signal in pending {
            let Some(sources) = registry.by_key.get(&SourceKey::Signal(signal)) else {
                continue;
            };
            for source in sources {
                if let SourceRef::Signal(signal_source) = source {
                    signal_source.fire_if_enabled();
                }
            }
        }
    }

    /// Fires every timer whose deadline has passed and re-arms repeating ones
    /// at `deadline + interval`.
    fn check_timers(&self) {
        let now = Instant::now();
        loop {
            let entry = self.inner.timers.lock().pop_expired(now);
            let Some(entry) = entry else { break };

            let source = entry.source;
            if !source.is_registered() {
                continue;
            }
            source.fire_if_enabled();

            if source.repeats() {
                self.inner
                    .timers
                    .lock()
                    .schedule(entry.deadline + source.interval(), source);
            } else {
                // A one-shot timer fires at most once.
                source.mark_unregistered();
            }
        }
    }
}

impl Default for EventManager {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("EventManager")
            .field("set_up", &self.inner.control.get().is_some())
            .field("registered_keys", &registry.by_key.len())
            .finish()
    }
}
