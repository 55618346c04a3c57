//! Background readiness monitor.
//!
//! A [`Monitor`] owns one OS thread that polls every registered socket with
//! outstanding interest and signals the matching [`WaitGate`]s. One monitor
//! can serve a single socket or be shared by many; sockets are keyed by
//! [`SocketId`].
//!
//! Per cycle the loop:
//!
//! 1. checks the stop flag,
//! 2. drains its [`Notifier`], then snapshots the sockets whose gates have
//!    waiters,
//! 3. polls them together with its [`Notifier`] for at most
//!    [`MonitorConfig::poll_interval`],
//! 4. signals ready gates and drops faulted sources.
//!
//! A failure of the poll call itself is fatal for the monitor: every gate is
//! released with [`Release::PollFault`] and the thread exits.
//!
//! Lifecycle changes are published as [`MonitorEvent`]s on a channel from
//! [`Monitor::events`]. The channel keeps the latest [`EVENT_BACKLOG`]
//! undelivered events; older ones are dropped.
//!
//! [`WaitGate`]: crate::gate::WaitGate

use crate::error::{Result, ZgateError};
use crate::events::Events;
use crate::gate::{Gates, Release};
use crate::options::MonitorConfig;
use crate::poller::{Notifier, PollEntry, PollEvent, Poller};
use crate::source::Probe;
use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, trace, warn};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Undelivered lifecycle events kept per monitor.
pub const EVENT_BACKLOG: usize = 64;

/// Process-unique identity of a monitored socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub fn next() -> Self {
        Self(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monitor lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Monitor thread is running.
    Started { thread: String },

    /// Socket added to the registry.
    Registered(SocketId),

    /// Socket removed from the registry by its owner.
    Deregistered(SocketId),

    /// Socket dropped after its readiness source failed.
    SourceFault { id: SocketId, reason: String },

    /// Poll call failed; the monitor has stopped.
    PollFault(String),

    /// Monitor thread exited.
    Stopped,
}

impl fmt::Display for MonitorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { thread } => write!(f, "Monitor started on thread {thread}"),
            Self::Registered(id) => write!(f, "Socket {id} registered"),
            Self::Deregistered(id) => write!(f, "Socket {id} deregistered"),
            Self::SourceFault { id, reason } => write!(f, "Socket {id} faulted: {reason}"),
            Self::PollFault(reason) => write!(f, "Poll failed: {reason}"),
            Self::Stopped => f.write_str("Monitor stopped"),
        }
    }
}

/// Handle returned by [`Monitor::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    id: SocketId,
    gates: Arc<Gates>,
}

impl Registration {
    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn gates(&self) -> &Arc<Gates> {
        &self.gates
    }
}

struct Entry {
    probe: Arc<dyn Probe>,
    fd: Arc<OwnedFd>,
    gates: Arc<Gates>,
}

struct Watched {
    id: SocketId,
    interest: Events,
    probe: Arc<dyn Probe>,
    fd: Arc<OwnedFd>,
    gates: Arc<Gates>,
}

struct Shared {
    config: MonitorConfig,
    registry: Mutex<HashMap<SocketId, Entry>>,
    /// Held by the loop for one poll cycle.
    cycle: Mutex<()>,
    stop: AtomicBool,
    fault: Mutex<Option<String>>,
    notifier: Arc<Notifier>,
    events_tx: flume::Sender<MonitorEvent>,
    events_rx: flume::Receiver<MonitorEvent>,
}

impl Shared {
    fn emit(&self, event: MonitorEvent) {
        let mut event = event;
        loop {
            match self.events_tx.try_send(event) {
                Ok(()) => return,
                Err(flume::TrySendError::Full(back)) => {
                    // Nobody is listening; forget the oldest.
                    let _ = self.events_rx.try_recv();
                    event = back;
                }
                Err(flume::TrySendError::Disconnected(_)) => return,
            }
        }
    }

    fn run(&self, poller: Poller) {
        debug!(thread = %self.config.thread_name, "[MONITOR] loop started");
        while !self.stop.load(Ordering::Acquire) {
            if let Err(e) = self.run_cycle(&poller) {
                self.fail(e.to_string());
                break;
            }
        }
        debug!(thread = %self.config.thread_name, "[MONITOR] loop exited");
        self.emit(MonitorEvent::Stopped);
    }

    fn run_cycle(&self, poller: &Poller) -> std::io::Result<()> {
        let cycle = self.cycle.lock();

        // Wakeups raised from here on interrupt this cycle's poll.
        self.notifier.drain();

        let watched: Vec<Watched> = self
            .registry
            .lock()
            .iter()
            .filter_map(|(id, entry)| {
                let interest = entry.gates.interest();
                (!interest.is_empty()).then(|| Watched {
                    id: *id,
                    interest,
                    probe: Arc::clone(&entry.probe),
                    fd: Arc::clone(&entry.fd),
                    gates: Arc::clone(&entry.gates),
                })
            })
            .collect();

        let entries: Vec<PollEntry<'_, usize>> = watched
            .iter()
            .enumerate()
            .map(|(idx, w)| PollEntry {
                key: idx,
                interest: w.interest,
                probe: &*w.probe,
                fd: w.fd.as_fd(),
            })
            .collect();

        let result = poller.poll(&entries, self.config.poll_interval);
        drop(entries);

        for event in result? {
            match event {
                PollEvent::Ready(idx, ready) => {
                    let w = &watched[idx];
                    trace!(socket = %w.id, events = %ready, "[MONITOR] ready");
                    w.gates.signal(ready);
                }
                PollEvent::Fault(idx, reason) => self.fault_source(watched[idx].id, reason),
            }
        }

        drop(watched);
        MutexGuard::unlock_fair(cycle);
        Ok(())
    }

    fn fault_source(&self, id: SocketId, reason: String) {
        let Some(entry) = self.registry.lock().remove(&id) else {
            // Deregistered while the cycle was running.
            return;
        };
        warn!(socket = %id, %reason, "[MONITOR] readiness source failed, dropping it");
        self.emit(MonitorEvent::SourceFault {
            id,
            reason: reason.clone(),
        });
        entry.gates.release(&Release::SourceFault(reason));
    }

    fn fail(&self, reason: String) {
        error!(%reason, "[MONITOR] poll failed, stopping");
        let drained: Vec<Entry> = {
            let mut registry = self.registry.lock();
            *self.fault.lock() = Some(reason.clone());
            registry.drain().map(|(_, entry)| entry).collect()
        };
        self.emit(MonitorEvent::PollFault(reason.clone()));
        let release = Release::PollFault(reason);
        for entry in drained {
            entry.gates.release(&release);
        }
    }
}

struct Inner {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn shutdown(&self) {
        let shared = &self.shared;
        shared.stop.store(true, Ordering::Release);
        shared.notifier.notify();

        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                error!("[MONITOR] monitor thread panicked");
            }
        }

        let drained: Vec<Entry> = shared
            .registry
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in drained {
            entry.gates.release(&Release::Closed);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Shared handle to a readiness monitor thread.
///
/// Clones refer to the same thread. The thread stops on
/// [`shutdown`](Self::shutdown) or when the last handle is dropped.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<Inner>,
}

impl Monitor {
    /// Start a monitor thread.
    pub fn spawn(config: MonitorConfig) -> Result<Self> {
        let poller = Poller::new()?;
        let (events_tx, events_rx) = flume::bounded(EVENT_BACKLOG);
        let shared = Arc::new(Shared {
            registry: Mutex::new(HashMap::new()),
            cycle: Mutex::new(()),
            stop: AtomicBool::new(false),
            fault: Mutex::new(None),
            notifier: poller.notifier(),
            events_tx,
            events_rx,
            config,
        });

        let thread_name = shared.config.thread_name.clone();
        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || worker.run(poller))?;

        shared.emit(MonitorEvent::Started {
            thread: thread_name,
        });
        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                thread: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.shared.config
    }

    /// Receiver for lifecycle events. Receivers are clones of one channel,
    /// so each event is delivered to a single receiver. At most
    /// [`EVENT_BACKLOG`] events wait for a receiver.
    pub fn events(&self) -> flume::Receiver<MonitorEvent> {
        self.inner.shared.events_rx.clone()
    }

    /// Add a socket and return its gates.
    ///
    /// # Errors
    ///
    /// - `AlreadyStarted` if `id` is registered already
    /// - `PollFault` if the monitor stopped on a poll failure
    /// - `MonitorStopped` after shutdown
    pub fn register(&self, id: SocketId, probe: Arc<dyn Probe>, fd: OwnedFd) -> Result<Registration> {
        let shared = &self.inner.shared;
        let gates = Arc::new(Gates::new(Some(Arc::clone(&shared.notifier))));
        {
            let mut registry = shared.registry.lock();
            if let Some(reason) = shared.fault.lock().clone() {
                return Err(ZgateError::PollFault(reason));
            }
            if shared.stop.load(Ordering::Acquire) {
                return Err(ZgateError::MonitorStopped);
            }
            if registry.contains_key(&id) {
                return Err(ZgateError::AlreadyStarted);
            }
            registry.insert(
                id,
                Entry {
                    probe,
                    fd: Arc::new(fd),
                    gates: Arc::clone(&gates),
                },
            );
        }
        shared.notifier.notify();
        debug!(socket = %id, "[MONITOR] registered");
        shared.emit(MonitorEvent::Registered(id));
        Ok(Registration { id, gates })
    }

    /// Remove a socket and release its waiters with `Closed`.
    ///
    /// When this returns, the monitor thread holds no reference to the
    /// socket's probe, so the caller may close the socket. Returns `false` if
    /// the socket was not registered (already removed or faulted).
    pub fn deregister(&self, id: SocketId) -> bool {
        let shared = &self.inner.shared;
        let Some(entry) = shared.registry.lock().remove(&id) else {
            return false;
        };
        entry.gates.release(&Release::Closed);
        drop(entry);

        // Interrupt the current poll and wait for its cycle to finish.
        shared.notifier.notify();
        drop(shared.cycle.lock());

        debug!(socket = %id, "[MONITOR] deregistered");
        shared.emit(MonitorEvent::Deregistered(id));
        true
    }

    pub fn is_registered(&self, id: SocketId) -> bool {
        self.inner.shared.registry.lock().contains_key(&id)
    }

    /// Number of registered sockets.
    pub fn len(&self) -> usize {
        self.inner.shared.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the monitor as if its poll call had failed with `reason`.
    ///
    /// Every registered socket is released with `PollFault(reason)` and later
    /// registrations are rejected with it. A no-op on a faulted monitor.
    pub fn abort(&self, reason: impl Into<String>) {
        let shared = &self.inner.shared;
        if shared.fault.lock().is_some() {
            return;
        }
        shared.fail(reason.into());
        shared.stop.store(true, Ordering::Release);
        shared.notifier.notify();
    }

    /// The poll failure that stopped this monitor, if any.
    pub fn fault(&self) -> Option<String> {
        self.inner.shared.fault.lock().clone()
    }

    /// Whether the monitor thread is still serving registrations.
    pub fn is_running(&self) -> bool {
        let shared = &self.inner.shared;
        !shared.stop.load(Ordering::Acquire)
            && shared.fault.lock().is_none()
            && self
                .inner
                .thread
                .lock()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the thread and release every remaining gate with `Closed`.
    ///
    /// Blocks until the thread has exited. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("thread", &self.inner.shared.config.thread_name)
            .field("sockets", &self.len())
            .field("fault", &self.fault())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, DONTWAIT};
    use crate::inproc;
    use crate::source::{RawSocket, SharedSource};
    use bytes::Bytes;
    use std::io;
    use std::time::Duration;

    fn recv_event(rx: &flume::Receiver<MonitorEvent>) -> MonitorEvent {
        rx.recv_timeout(Duration::from_secs(2)).unwrap()
    }

    fn watch(
        monitor: &Monitor,
        socket: inproc::InprocSocket,
    ) -> (Arc<SharedSource<inproc::InprocSocket>>, Registration) {
        let fd = socket.readiness_fd().unwrap();
        let source = Arc::new(SharedSource::new(socket));
        let registration = monitor
            .register(SocketId::next(), Arc::clone(&source) as Arc<dyn Probe>, fd)
            .unwrap();
        (source, registration)
    }

    struct Broken;

    impl Probe for Broken {
        fn probe(&self) -> Option<io::Result<Events>> {
            Some(Err(io::Error::new(io::ErrorKind::Other, "broken source")))
        }
    }

    #[test]
    fn test_socket_ids_are_unique() {
        let a = SocketId::next();
        let b = SocketId::next();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(MonitorEvent::Stopped.to_string(), "Monitor stopped");
        assert_eq!(
            MonitorEvent::PollFault("EBADF".into()).to_string(),
            "Poll failed: EBADF"
        );
    }

    #[test]
    fn test_register_twice_rejected() {
        let monitor = Monitor::spawn(MonitorConfig::default()).unwrap();
        let events = monitor.events();
        assert!(matches!(recv_event(&events), MonitorEvent::Started { .. }));

        let (a, _b) = inproc::pair(4).unwrap();
        let fd = a.readiness_fd().unwrap();
        let dup = a.readiness_fd().unwrap();
        let source: Arc<dyn Probe> = Arc::new(SharedSource::new(a));
        let id = SocketId::next();

        monitor.register(id, Arc::clone(&source), fd).unwrap();
        assert_eq!(recv_event(&events), MonitorEvent::Registered(id));
        assert!(matches!(
            monitor.register(id, source, dup),
            Err(ZgateError::AlreadyStarted)
        ));
        assert_eq!(monitor.len(), 1);
    }

    #[test]
    fn test_readable_gate_signaled() {
        let monitor = Monitor::spawn(MonitorConfig::default()).unwrap();
        let (a, b) = inproc::pair(4).unwrap();
        let (_source, registration) = watch(&monitor, a);
        let gate = registration.gates().get(EventKind::Readable);

        gate.arm();
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let mut b = b;
            b.send(Bytes::from("wake"), DONTWAIT).unwrap();
            b
        });

        futures::executor::block_on(gate.wait()).unwrap();
        assert!(gate.is_signaled());
        drop(sender.join().unwrap());
    }

    #[test]
    fn test_deregister_releases_waiters() {
        let monitor = Monitor::spawn(MonitorConfig::default()).unwrap();
        let (a, _b) = inproc::pair(4).unwrap();
        let (source, registration) = watch(&monitor, a);
        let gates = Arc::clone(registration.gates());

        let closer = {
            let monitor = monitor.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                assert!(monitor.deregister(registration.id()));
                assert!(!monitor.deregister(registration.id()));
            })
        };

        let result = futures::executor::block_on(gates.get(EventKind::Readable).wait());
        assert!(matches!(result, Err(ZgateError::SocketClosed)));
        closer.join().unwrap();

        assert!(monitor.is_empty());
        assert!(source.close().unwrap());
    }

    #[test]
    fn test_source_fault_is_isolated() {
        let monitor = Monitor::spawn(MonitorConfig::default()).unwrap();
        let events = monitor.events();
        let (a, b) = inproc::pair(4).unwrap();
        let (_source, healthy) = watch(&monitor, a);

        let notifier = Notifier::new().unwrap();
        let broken_id = SocketId::next();
        let broken = monitor
            .register(broken_id, Arc::new(Broken), notifier.try_clone_fd().unwrap())
            .unwrap();

        let result =
            futures::executor::block_on(broken.gates().get(EventKind::Writable).wait());
        assert!(matches!(result, Err(ZgateError::SourceFault(_))));
        assert!(!monitor.is_registered(broken_id));
        assert!(monitor.is_registered(healthy.id()));

        let fault = loop {
            match recv_event(&events) {
                MonitorEvent::SourceFault { id, .. } => break id,
                _ => continue,
            }
        };
        assert_eq!(fault, broken_id);

        // The healthy socket keeps being served.
        let mut b = b;
        b.send(Bytes::from("still here"), DONTWAIT).unwrap();
        let gate = healthy.gates().get(EventKind::Readable);
        gate.arm();
        futures::executor::block_on(gate.wait()).unwrap();
        assert!(monitor.is_running());
    }

    #[test]
    fn test_poll_failure_releases_everything() {
        let monitor = Monitor::spawn(MonitorConfig::default()).unwrap();
        let (a, _b) = inproc::pair(4).unwrap();
        let (_source, registration) = watch(&monitor, a);

        let events = monitor.events();
        monitor.abort("EINVAL");
        monitor.abort("ignored");

        let result =
            futures::executor::block_on(registration.gates().get(EventKind::Readable).wait());
        assert!(matches!(result, Err(ZgateError::PollFault(_))));
        assert_eq!(monitor.fault().as_deref(), Some("EINVAL"));
        assert!(!monitor.is_running());

        let (c, _d) = inproc::pair(4).unwrap();
        let fd = c.readiness_fd().unwrap();
        let err = monitor
            .register(SocketId::next(), Arc::new(SharedSource::new(c)), fd)
            .unwrap_err();
        assert!(matches!(err, ZgateError::PollFault(_)));

        let fault = loop {
            if let MonitorEvent::PollFault(reason) = recv_event(&events) {
                break reason;
            }
        };
        assert_eq!(fault, "EINVAL");
        assert_eq!(recv_event(&events), MonitorEvent::Stopped);
    }

    #[test]
    fn test_new_waiter_wakes_idle_monitor() {
        let monitor = Monitor::spawn(
            MonitorConfig::new().with_poll_interval(Duration::from_secs(30)),
        )
        .unwrap();
        let (a, b) = inproc::pair(4).unwrap();
        let (_source, registration) = watch(&monitor, a);

        // Let the loop settle into a poll with nothing to watch.
        std::thread::sleep(Duration::from_millis(50));
        let mut b = b;
        b.send(Bytes::from("late"), DONTWAIT).unwrap();

        let start = std::time::Instant::now();
        let gate = registration.gates().get(EventKind::Readable);
        gate.arm();
        futures::executor::block_on(gate.wait()).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));

        let start = std::time::Instant::now();
        assert!(monitor.deregister(registration.id()));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_event_backlog_is_bounded() {
        let monitor = Monitor::spawn(MonitorConfig::default()).unwrap();
        let events = monitor.events();
        let mut last = None;
        for _ in 0..500 {
            let (a, _b) = inproc::pair(1).unwrap();
            let (_source, registration) = watch(&monitor, a);
            assert!(monitor.deregister(registration.id()));
            last = Some(registration.id());
        }

        assert!(events.len() <= EVENT_BACKLOG);
        let seen: Vec<MonitorEvent> = events.drain().collect();
        assert_eq!(seen.last(), Some(&MonitorEvent::Deregistered(last.unwrap())));
    }

    #[test]
    fn test_shutdown_releases_and_rejects() {
        let monitor = Monitor::spawn(MonitorConfig::new().with_thread_name("zgate-test")).unwrap();
        let events = monitor.events();
        let (a, _b) = inproc::pair(4).unwrap();
        let (_source, registration) = watch(&monitor, a);

        monitor.shutdown();
        monitor.shutdown();
        assert!(!monitor.is_running());
        assert_eq!(
            registration.gates().get(EventKind::Writable).released(),
            Some(Release::Closed)
        );

        let (c, _d) = inproc::pair(4).unwrap();
        let fd = c.readiness_fd().unwrap();
        let err = monitor
            .register(SocketId::next(), Arc::new(SharedSource::new(c)), fd)
            .unwrap_err();
        assert!(matches!(err, ZgateError::MonitorStopped));

        let seen: Vec<MonitorEvent> = events.drain().collect();
        assert_eq!(
            seen.first(),
            Some(&MonitorEvent::Started {
                thread: "zgate-test".into()
            })
        );
        assert_eq!(seen.last(), Some(&MonitorEvent::Stopped));
    }
}
