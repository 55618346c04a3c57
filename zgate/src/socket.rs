//! Async facade over a blocking socket.

use crate::poll::{wait_any, PollItem};
use async_lock::Mutex as TurnLock;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::ops::Deref;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use zgate_core::error::{Result, ZgateError};
use zgate_core::events::{EventKind, Events, DONTWAIT};
use zgate_core::gate::{Gates, Release};
use zgate_core::monitor::{Monitor, Registration, SocketId};
use zgate_core::options::{MonitorConfig, SocketOptions, DEFAULT_POLL_INTERVAL};
use zgate_core::poller::wait_fd;
use zgate_core::socket_type::SocketType;
use zgate_core::source::{Probe, RawSocket, SharedSource};

/// Observable lifecycle state of an [`AsyncSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Wrapped, not yet monitored. Only synchronous calls are allowed.
    Unstarted,
    /// Registered with a monitor; async calls are allowed.
    Monitoring,
    /// The monitor dropped the socket (source fault, poll fault or monitor
    /// shutdown). Async calls fail with that reason; exit still closes.
    Faulted,
    /// Terminal. The wrapped socket is closed.
    Closed,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unstarted => "unstarted",
            Self::Monitoring => "monitoring",
            Self::Faulted => "faulted",
            Self::Closed => "closed",
        })
    }
}

enum Lifecycle {
    Unstarted,
    Monitoring {
        monitor: Monitor,
        registration: Registration,
        /// Spawned by this socket, shut down with it.
        owned: bool,
    },
    Faulted {
        monitor: Monitor,
        registration: Registration,
        owned: bool,
        release: Release,
    },
    Closed,
}

impl Lifecycle {
    fn state(&self) -> SocketState {
        match self {
            Self::Unstarted => SocketState::Unstarted,
            Self::Monitoring { .. } => SocketState::Monitoring,
            Self::Faulted { .. } => SocketState::Faulted,
            Self::Closed => SocketState::Closed,
        }
    }
}

/// Async wrapper around a [`RawSocket`].
///
/// `asend`/`arecv` suspend the calling task until the monitor thread reports
/// the socket writable/readable, then perform the operation without
/// blocking. Nothing on the async runtime's thread ever blocks on the socket.
///
/// The socket must be started (see [`enter`](Self::enter)) before any async
/// call. Exiting stops monitoring, releases every suspended call with
/// `SocketClosed`, then closes the wrapped socket.
///
/// Concurrent calls of the same kind (two `asend`s, or two `arecv`s) are
/// queued in arrival order; a send and a receive proceed independently.
///
/// ## Example
///
/// ```rust,no_run
/// use zgate::prelude::*;
///
/// # async fn example() -> zgate::Result<()> {
/// let (a, b) = zgate::inproc::pair(1000)?;
/// let a = AsyncSocket::new(a);
/// let b = AsyncSocket::new(b);
/// let _a = a.enter()?;
/// let _b = b.enter()?;
///
/// a.asend(Bytes::from("Hello"), 0).await?;
/// assert_eq!(b.arecv(0).await?, Bytes::from("Hello"));
/// # Ok(())
/// # }
/// ```
pub struct AsyncSocket<S: RawSocket> {
    id: SocketId,
    raw: Arc<SharedSource<S>>,
    options: SocketOptions,
    shared_monitor: Option<Monitor>,
    monitor_config: MonitorConfig,
    state: Mutex<Lifecycle>,
    send_turn: TurnLock<()>,
    recv_turn: TurnLock<()>,
}

impl<S: RawSocket> AsyncSocket<S> {
    /// Wrap `raw`. A dedicated monitor thread is spawned when the socket starts.
    pub fn new(raw: S) -> Self {
        Self::with_options(raw, SocketOptions::default())
    }

    /// Wrap `raw` with custom options.
    pub fn with_options(raw: S, options: SocketOptions) -> Self {
        Self::build(raw, options, None)
    }

    /// Wrap `raw` and register it with an existing, possibly shared, monitor.
    pub fn with_monitor(raw: S, monitor: Monitor, options: SocketOptions) -> Self {
        Self::build(raw, options, Some(monitor))
    }

    fn build(raw: S, options: SocketOptions, shared_monitor: Option<Monitor>) -> Self {
        Self {
            id: SocketId::next(),
            raw: Arc::new(SharedSource::new(raw)),
            options,
            shared_monitor,
            monitor_config: MonitorConfig::default(),
            state: Mutex::new(Lifecycle::Unstarted),
            send_turn: TurnLock::new(()),
            recv_turn: TurnLock::new(()),
        }
    }

    /// Configure the dedicated monitor. Ignored with [`with_monitor`](Self::with_monitor).
    #[must_use]
    pub fn with_monitor_config(mut self, config: MonitorConfig) -> Self {
        self.monitor_config = config;
        self
    }

    /// Start monitoring and return a guard that exits on drop.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` if the socket is monitored already, `SocketClosed`
    /// after exit.
    pub fn enter(&self) -> Result<SocketGuard<'_, S>> {
        self.start()?;
        Ok(SocketGuard { socket: self })
    }

    /// Start monitoring. Prefer [`enter`](Self::enter).
    ///
    /// # Errors
    ///
    /// See [`enter`](Self::enter). Spawn and registration failures are
    /// returned as is and leave the socket unstarted.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            Lifecycle::Unstarted => {}
            Lifecycle::Monitoring { .. } | Lifecycle::Faulted { .. } => {
                return Err(ZgateError::AlreadyStarted)
            }
            Lifecycle::Closed => return Err(ZgateError::SocketClosed),
        }

        let fd = self.raw.with(|s| s.readiness_fd())?;
        let (monitor, owned) = match &self.shared_monitor {
            Some(monitor) => (monitor.clone(), false),
            None => {
                let config = self.monitor_config.clone().with_thread_name(format!(
                    "{}-{}",
                    self.monitor_config.thread_name,
                    self.id.get()
                ));
                (Monitor::spawn(config)?, true)
            }
        };

        let probe: Arc<dyn Probe> = Arc::clone(&self.raw) as Arc<dyn Probe>;
        let registration = match monitor.register(self.id, probe, fd) {
            Ok(registration) => registration,
            Err(e) => {
                if owned {
                    monitor.shutdown();
                }
                return Err(e);
            }
        };

        debug!(socket = %self.id, owned, "[SOCKET] monitoring started");
        *state = Lifecycle::Monitoring {
            monitor,
            registration,
            owned,
        };
        Ok(())
    }

    /// Stop monitoring and close the wrapped socket.
    ///
    /// Suspended async calls resume with `SocketClosed`. Exiting a faulted
    /// socket closes it normally.
    ///
    /// # Errors
    ///
    /// `NotStarted` if the socket was never started, `SocketClosed` if it has
    /// already exited or closed, or the wrapped socket's close error.
    pub fn exit(&self) -> Result<()> {
        let previous = {
            let mut state = self.state.lock();
            match *state {
                Lifecycle::Unstarted => return Err(ZgateError::NotStarted),
                Lifecycle::Closed => return Err(ZgateError::SocketClosed),
                Lifecycle::Monitoring { .. } | Lifecycle::Faulted { .. } => {}
            }
            std::mem::replace(&mut *state, Lifecycle::Closed)
        };
        self.teardown(previous)
    }

    /// Close the socket from any state. A no-op once closed.
    pub fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock(), Lifecycle::Closed);
        match previous {
            Lifecycle::Closed => Ok(()),
            previous => self.teardown(previous),
        }
    }

    fn teardown(&self, previous: Lifecycle) -> Result<()> {
        // Monitoring must stop before the handle is closed.
        let detached = match previous {
            Lifecycle::Monitoring {
                monitor,
                registration,
                owned,
            }
            | Lifecycle::Faulted {
                monitor,
                registration,
                owned,
                ..
            } => Some((monitor, registration, owned)),
            Lifecycle::Unstarted | Lifecycle::Closed => None,
        };
        if let Some((monitor, registration, owned)) = detached {
            if owned {
                monitor.shutdown();
            } else {
                monitor.deregister(registration.id());
            }
        }
        self.raw.close()?;
        debug!(socket = %self.id, "[SOCKET] closed");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SocketState {
        self.state.lock().state()
    }

    /// Identity of this socket in its monitor.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Options this socket was created with.
    pub fn options(&self) -> &SocketOptions {
        &self.options
    }

    /// The monitor serving this socket while it is monitored.
    pub fn monitor(&self) -> Option<Monitor> {
        match &*self.state.lock() {
            Lifecycle::Monitoring { monitor, .. } => Some(monitor.clone()),
            _ => None,
        }
    }

    /// Why the monitor dropped this socket, once it is faulted.
    pub fn fault(&self) -> Option<ZgateError> {
        match &*self.state.lock() {
            Lifecycle::Faulted { release, .. } => Some(release.to_error()),
            _ => None,
        }
    }

    /// Number of tasks suspended on readiness of `kind`.
    pub fn waiters(&self, kind: EventKind) -> usize {
        match &*self.state.lock() {
            Lifecycle::Monitoring { registration, .. } => registration.gates().get(kind).waiters(),
            _ => 0,
        }
    }

    /// Gates of a healthy monitored socket.
    ///
    /// Gates released while the socket is still monitored mean the monitor
    /// dropped it; the socket moves to `Faulted` and the reason is returned
    /// without touching the wrapped socket.
    fn gates(&self) -> Result<Arc<Gates>> {
        let mut state = self.state.lock();
        let release = match &*state {
            Lifecycle::Unstarted => return Err(ZgateError::NotStarted),
            Lifecycle::Faulted { release, .. } => return Err(release.to_error()),
            Lifecycle::Closed => return Err(ZgateError::SocketClosed),
            Lifecycle::Monitoring { registration, .. } => match registration.gates().released() {
                None => return Ok(Arc::clone(registration.gates())),
                Some(release) => release,
            },
        };

        warn!(socket = %self.id, reason = %release, "[SOCKET] dropped by monitor");
        let err = release.to_error();
        if let Lifecycle::Monitoring {
            monitor,
            registration,
            owned,
        } = std::mem::replace(&mut *state, Lifecycle::Closed)
        {
            *state = Lifecycle::Faulted {
                monitor,
                registration,
                owned,
                release,
            };
        }
        Err(err)
    }

    /// Send one frame, suspending until the socket is writable.
    ///
    /// `SNDMORE` in `flags` marks more frames of the same message. With
    /// `DONTWAIT` (or a zero send timeout) a single attempt is made and
    /// "would block" is returned as an `Io` error.
    ///
    /// # Errors
    ///
    /// `NotStarted`/`SocketClosed` outside monitoring, `Timeout` when the
    /// send timeout elapses, `SocketClosed`/`SourceFault`/`PollFault` when
    /// the wait is released, or the socket's own send error.
    pub async fn asend(&self, frame: Bytes, flags: i32) -> Result<()> {
        self.drive(EventKind::Writable, flags, |s, flags| s.send(frame.clone(), flags))
            .await
    }

    /// Send a whole message, suspending until the socket is writable.
    ///
    /// # Errors
    ///
    /// As [`asend`](Self::asend); an empty frame list is `InvalidInput`.
    pub async fn asend_multipart(&self, frames: Vec<Bytes>, flags: i32) -> Result<()> {
        self.drive(EventKind::Writable, flags, |s, flags| {
            s.send_multipart(frames.clone(), flags)
        })
        .await
    }

    /// Receive one frame, suspending until the socket is readable.
    ///
    /// # Errors
    ///
    /// As [`asend`](Self::asend), with the receive timeout.
    pub async fn arecv(&self, flags: i32) -> Result<Bytes> {
        self.drive(EventKind::Readable, flags, |s, flags| s.recv(flags))
            .await
    }

    /// Receive every frame of the next message, suspending until readable.
    ///
    /// # Errors
    ///
    /// As [`arecv`](Self::arecv).
    pub async fn arecv_multipart(&self, flags: i32) -> Result<Vec<Bytes>> {
        self.drive(EventKind::Readable, flags, |s, flags| s.recv_multipart(flags))
            .await
    }

    /// Serialize `value` as JSON and send it as one frame.
    ///
    /// # Errors
    ///
    /// As [`asend`](Self::asend). A value that cannot be serialized is an
    /// `InvalidData` I/O error and nothing is sent.
    #[cfg(feature = "serde")]
    pub async fn asend_json<T>(&self, value: &T, flags: i32) -> Result<()>
    where
        T: serde::Serialize + ?Sized,
    {
        let json = serde_json::to_vec(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.asend(Bytes::from(json), flags).await
    }

    /// Receive one frame and parse it as JSON.
    ///
    /// # Errors
    ///
    /// As [`arecv`](Self::arecv). A frame that does not parse as `T` is an
    /// `InvalidData` I/O error; the frame is consumed either way.
    #[cfg(feature = "serde")]
    pub async fn arecv_json<T: serde::de::DeserializeOwned>(&self, flags: i32) -> Result<T> {
        let frame = self.arecv(flags).await?;
        let value = serde_json::from_slice(&frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(value)
    }

    /// Wait-then-act loop shared by every async operation.
    async fn drive<T>(
        &self,
        kind: EventKind,
        flags: i32,
        mut op: impl FnMut(&mut S, i32) -> io::Result<T>,
    ) -> Result<T> {
        let gates = self.gates()?;
        let (timeout, nonblocking, turn) = match kind {
            EventKind::Writable => (
                self.options.send_timeout,
                self.options.is_send_nonblocking(),
                &self.send_turn,
            ),
            EventKind::Readable => (
                self.options.recv_timeout,
                self.options.is_recv_nonblocking(),
                &self.recv_turn,
            ),
        };

        if flags & DONTWAIT != 0 || nonblocking {
            return self.raw.with(|s| op(s, flags | DONTWAIT));
        }

        let cycle = async {
            let _turn = turn.lock().await;
            let gate = gates.get(kind);
            loop {
                gate.arm();
                match self.raw.with(|s| op(s, flags | DONTWAIT)) {
                    Err(e) if e.is_would_block() => {}
                    done => return done,
                }
                trace!(socket = %self.id, %kind, "[SOCKET] would block, waiting");
                gate.wait().await?;
            }
        };

        match timeout {
            Some(limit) => compio::time::timeout(limit, cycle)
                .await
                .map_err(|_| ZgateError::Timeout(limit))?,
            None => cycle.await,
        }
    }

    /// Suspend until any of `events` is ready.
    ///
    /// Returns the ready subset of `events`, or an empty mask when `timeout`
    /// elapses. `Some(Duration::ZERO)` checks once; `None` waits forever.
    ///
    /// # Errors
    ///
    /// `NotStarted`/`SocketClosed` outside monitoring, or the release reason
    /// if the socket leaves the monitor while waiting.
    pub async fn apoll(&self, events: Events, timeout: Option<Duration>) -> Result<Events> {
        let gates = self.gates()?;
        let requested = events & Events::ALL;
        if requested.is_empty() {
            return Ok(Events::empty());
        }
        let once = timeout.is_some_and(|d| d.is_zero());
        let cycle = self.poll_cycle(&gates, requested, once);

        match timeout {
            Some(limit) if !once => match compio::time::timeout(limit, cycle).await {
                Ok(result) => result,
                Err(_) => Ok(Events::empty()),
            },
            _ => cycle.await,
        }
    }

    async fn poll_cycle(&self, gates: &Gates, requested: Events, once: bool) -> Result<Events> {
        loop {
            gates.arm(requested);
            let ready = self.events()? & requested;
            if !ready.is_empty() || once {
                return Ok(ready);
            }
            wait_any(requested.kinds().map(|kind| gates.get(kind).wait()).collect()).await?;
        }
    }

    /// Send one frame, blocking the current thread as the socket dictates.
    ///
    /// Works while unstarted or monitored.
    pub fn send(&self, frame: Bytes, flags: i32) -> Result<()> {
        self.raw.with(|s| s.send(frame, flags))
    }

    /// Blocking counterpart of [`asend_multipart`](Self::asend_multipart).
    pub fn send_multipart(&self, frames: Vec<Bytes>, flags: i32) -> Result<()> {
        self.raw.with(|s| s.send_multipart(frames, flags))
    }

    /// Blocking counterpart of [`arecv`](Self::arecv).
    pub fn recv(&self, flags: i32) -> Result<Bytes> {
        self.raw.with(|s| s.recv(flags))
    }

    /// Blocking counterpart of [`arecv_multipart`](Self::arecv_multipart).
    pub fn recv_multipart(&self, flags: i32) -> Result<Vec<Bytes>> {
        self.raw.with(|s| s.recv_multipart(flags))
    }

    /// Whether more frames of the current message follow.
    pub fn has_more(&self) -> Result<bool> {
        self.raw.with(|s| s.has_more())
    }

    /// Current readiness, without blocking.
    pub fn events(&self) -> Result<Events> {
        self.raw.with(|s| s.events())
    }

    /// Block the current thread until any of `events` is ready.
    ///
    /// Same result convention as [`apoll`](Self::apoll).
    pub fn poll(&self, events: Events, timeout: Option<Duration>) -> Result<Events> {
        let requested = events & Events::ALL;
        let fd = self.raw.with(|s| s.readiness_fd())?;
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            let ready = self.raw.with(|s| s.events())? & requested;
            if !ready.is_empty() || requested.is_empty() {
                return Ok(ready);
            }
            // The monitor may consume an edge first, so re-check at least
            // once per poll interval.
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Events::empty());
                    }
                    (deadline - now).min(DEFAULT_POLL_INTERVAL)
                }
                None => DEFAULT_POLL_INTERVAL,
            };
            wait_fd(fd.as_fd(), Some(slice))?;
        }
    }

    /// Pattern type of the wrapped socket.
    pub fn socket_type(&self) -> Result<SocketType> {
        self.raw.with(|s| Ok(s.socket_type()))
    }
}

impl<S: RawSocket> PollItem for AsyncSocket<S> {
    fn poll_id(&self) -> SocketId {
        self.id
    }

    fn gates(&self) -> Result<Arc<Gates>> {
        AsyncSocket::gates(self)
    }

    fn ready(&self) -> Result<Events> {
        self.events()
    }
}

impl<S: RawSocket> fmt::Debug for AsyncSocket<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSocket")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("options", &self.options)
            .finish()
    }
}

impl<S: RawSocket> Drop for AsyncSocket<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(socket = %self.id, error = %e, "[SOCKET] close on drop failed");
        }
    }
}

/// Scope of one monitoring session, from [`AsyncSocket::enter`].
///
/// Dropping the guard exits the socket if it is still monitored.
#[must_use = "dropping the guard exits the socket immediately"]
pub struct SocketGuard<'a, S: RawSocket> {
    socket: &'a AsyncSocket<S>,
}

impl<S: RawSocket> SocketGuard<'_, S> {
    /// Exit now and observe the result.
    ///
    /// # Errors
    ///
    /// As [`AsyncSocket::exit`].
    pub fn exit(self) -> Result<()> {
        self.socket.exit()
    }
}

impl<S: RawSocket> Deref for SocketGuard<'_, S> {
    type Target = AsyncSocket<S>;

    fn deref(&self) -> &Self::Target {
        self.socket
    }
}

impl<S: RawSocket> Drop for SocketGuard<'_, S> {
    fn drop(&mut self) {
        if !matches!(
            self.socket.state(),
            SocketState::Monitoring | SocketState::Faulted
        ) {
            return;
        }
        if let Err(e) = self.socket.exit() {
            warn!(socket = %self.socket.id, error = %e, "[SOCKET] exit on scope end failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zgate_core::inproc;

    #[test]
    fn test_state_machine() {
        let (a, _b) = inproc::pair(4).unwrap();
        let socket = AsyncSocket::new(a);
        assert_eq!(socket.state(), SocketState::Unstarted);
        assert!(matches!(socket.exit(), Err(ZgateError::NotStarted)));

        socket.start().unwrap();
        assert_eq!(socket.state(), SocketState::Monitoring);
        assert!(matches!(socket.start(), Err(ZgateError::AlreadyStarted)));
        assert!(socket.monitor().is_some());

        socket.exit().unwrap();
        assert_eq!(socket.state(), SocketState::Closed);
        assert!(matches!(socket.exit(), Err(ZgateError::SocketClosed)));
        assert!(matches!(socket.start(), Err(ZgateError::SocketClosed)));
        socket.close().unwrap();
    }

    #[test]
    fn test_sync_calls_before_start() {
        let (a, b) = inproc::pair(4).unwrap();
        let a = AsyncSocket::new(a);
        let b = AsyncSocket::new(b);
        a.send(Bytes::from("sync"), 0).unwrap();
        assert_eq!(
            b.poll(Events::READABLE, Some(Duration::from_secs(1))).unwrap(),
            Events::READABLE
        );
        assert_eq!(b.recv(0).unwrap(), Bytes::from("sync"));
        assert!(!b.has_more().unwrap());
        assert_eq!(b.socket_type().unwrap(), SocketType::Pair);

        a.close().unwrap();
        assert!(matches!(a.send(Bytes::from("x"), 0), Err(ZgateError::SocketClosed)));
        assert!(matches!(a.events(), Err(ZgateError::SocketClosed)));
    }

    #[test]
    fn test_sync_poll_times_out() {
        let (a, _b) = inproc::pair(4).unwrap();
        let a = AsyncSocket::new(a);
        let start = Instant::now();
        let ready = a.poll(Events::READABLE, Some(Duration::from_millis(30))).unwrap();
        assert!(ready.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_guard_exits_on_drop() {
        let (a, _b) = inproc::pair(4).unwrap();
        let socket = AsyncSocket::new(a);
        {
            let guard = socket.enter().unwrap();
            assert_eq!(guard.state(), SocketState::Monitoring);
            assert!(matches!(socket.enter(), Err(ZgateError::AlreadyStarted)));
        }
        assert_eq!(socket.state(), SocketState::Closed);
    }

    #[test]
    fn test_failed_start_stays_unstarted() {
        let monitor = Monitor::spawn(MonitorConfig::default()).unwrap();
        monitor.shutdown();
        let (a, _b) = inproc::pair(4).unwrap();
        let socket = AsyncSocket::with_monitor(a, monitor, SocketOptions::default());
        assert!(matches!(socket.start(), Err(ZgateError::MonitorStopped)));
        assert_eq!(socket.state(), SocketState::Unstarted);
    }
}
