//! Multiplexed readiness wait over a set of sources.
//!
//! Readiness descriptors handed out by messaging sockets are often
//! edge-style (libzmq's `ZMQ_FD` only says "look again"), so the poller never
//! trusts the descriptor alone: it probes every source before and after
//! blocking, and only the probed [`Events`] decide what is ready.
//!
//! A [`Notifier`] is always part of the set. Raising it interrupts a blocked
//! poll so the caller can rebuild its interest set.

use crate::events::Events;
use crate::source::Probe;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Poll bound while a source is locked by an in-flight operation.
const BUSY_RETRY: Duration = Duration::from_millis(1);

/// Self-pipe style wake source.
///
/// Both ends are non-blocking; raising a notifier that is already raised is a no-op.
#[derive(Debug)]
pub struct Notifier {
    rx: UnixStream,
    tx: UnixStream,
}

impl Notifier {
    pub fn new() -> io::Result<Self> {
        let (rx, tx) = UnixStream::pair()?;
        rx.set_nonblocking(true)?;
        tx.set_nonblocking(true)?;
        Ok(Self { rx, tx })
    }

    /// Make the descriptor readable.
    pub fn notify(&self) {
        // A full buffer means a wakeup is already pending.
        let _ = (&self.tx).write(&[1]);
    }

    /// Consume pending wakeups. Returns `true` if any were pending.
    pub fn drain(&self) -> bool {
        let mut buf = [0u8; 64];
        let mut drained = false;
        loop {
            match (&self.rx).read(&mut buf) {
                Ok(0) => return drained,
                Ok(_) => drained = true,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return drained,
            }
        }
    }

    /// Duplicate the readable end for a poller that outlives this borrow.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.rx.as_fd().try_clone_to_owned()
    }
}

impl AsFd for Notifier {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.rx.as_fd()
    }
}

/// One source to wait on.
pub struct PollEntry<'a, K> {
    pub key: K,
    pub interest: Events,
    pub probe: &'a dyn Probe,
    pub fd: BorrowedFd<'a>,
}

/// Per-source result of [`Poller::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent<K> {
    /// The probed readiness intersects the interest; carries the intersection.
    Ready(K, Events),
    /// The source is unusable; it should be dropped from the set.
    Fault(K, String),
}

impl<K> PollEvent<K> {
    pub fn key(&self) -> &K {
        match self {
            Self::Ready(key, _) | Self::Fault(key, _) => key,
        }
    }
}

/// Blocking readiness multiplexer with an interrupt source.
pub struct Poller {
    notifier: Arc<Notifier>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            notifier: Arc::new(Notifier::new()?),
        })
    }

    /// Handle that interrupts a blocked [`poll`](Self::poll) from any thread.
    pub fn notifier(&self) -> Arc<Notifier> {
        Arc::clone(&self.notifier)
    }

    /// Block until a source is ready, a source faults, the timeout elapses,
    /// or the notifier is raised.
    ///
    /// Sources whose probe reports busy are skipped for this call. The
    /// notifier is not drained here; the caller drains it before building
    /// `entries`, so a wakeup raised after that point interrupts this call.
    ///
    /// Returns an empty list on timeout or interruption. Faults are reported
    /// per source and never fail the whole call.
    ///
    /// # Errors
    ///
    /// Only a failure of the poll system call itself (other than `EINTR`).
    pub fn poll<K: Copy>(
        &self,
        entries: &[PollEntry<'_, K>],
        timeout: Duration,
    ) -> io::Result<Vec<PollEvent<K>>> {
        let mut events = Vec::new();
        let mut waitable = Vec::with_capacity(entries.len());
        let mut busy = false;
        for (idx, entry) in entries.iter().enumerate() {
            match sweep(entry) {
                Sweep::Ready(ready) => events.push(PollEvent::Ready(entry.key, ready)),
                Sweep::Fault(reason) => events.push(PollEvent::Fault(entry.key, reason)),
                Sweep::Pending => waitable.push(idx),
                Sweep::Busy => busy = true,
            }
        }
        if !events.is_empty() {
            return Ok(events);
        }
        // A busy source is left out of the set; come back for it soon.
        let timeout = if busy {
            timeout.min(BUSY_RETRY)
        } else {
            timeout
        };

        let mut fds = Vec::with_capacity(waitable.len() + 1);
        fds.push(PollFd::new(self.notifier.as_fd(), PollFlags::POLLIN));
        for &idx in &waitable {
            fds.push(PollFd::new(entries[idx].fd, PollFlags::POLLIN));
        }

        match nix::poll::poll(&mut fds, poll_timeout(timeout)) {
            Ok(0) => return Ok(events),
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(events),
            Err(e) => return Err(io::Error::from(e)),
        }

        let fault_flags = PollFlags::POLLERR | PollFlags::POLLNVAL | PollFlags::POLLHUP;
        for (slot, &idx) in waitable.iter().enumerate() {
            let entry = &entries[idx];
            let revents = fds[slot + 1].revents().unwrap_or(PollFlags::empty());
            if revents.intersects(fault_flags) {
                events.push(PollEvent::Fault(
                    entry.key,
                    format!("descriptor reported {revents:?}"),
                ));
                continue;
            }
            if revents.contains(PollFlags::POLLIN) {
                match sweep(entry) {
                    Sweep::Ready(ready) => events.push(PollEvent::Ready(entry.key, ready)),
                    Sweep::Fault(reason) => events.push(PollEvent::Fault(entry.key, reason)),
                    Sweep::Pending | Sweep::Busy => {}
                }
            }
        }
        trace!(ready = events.len(), "[POLLER] poll returned");
        Ok(events)
    }
}

enum Sweep {
    Ready(Events),
    Fault(String),
    Pending,
    Busy,
}

fn sweep<K>(entry: &PollEntry<'_, K>) -> Sweep {
    match entry.probe.probe() {
        None => Sweep::Busy,
        Some(Ok(events)) => {
            let ready = events & entry.interest;
            if ready.is_empty() {
                Sweep::Pending
            } else {
                Sweep::Ready(ready)
            }
        }
        Some(Err(e)) => Sweep::Fault(e.to_string()),
    }
}

/// Block until `fd` is readable or `timeout` elapses (`None` waits forever).
///
/// Returns `true` if the descriptor fired.
pub fn wait_fd(fd: BorrowedFd<'_>, timeout: Option<Duration>) -> io::Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let timeout = timeout.map_or(PollTimeout::NONE, poll_timeout);
    match nix::poll::poll(&mut fds, timeout) {
        Ok(n) => Ok(n > 0),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(io::Error::from(e)),
    }
}

/// Millisecond poll timeout, rounded up so short waits never become busy loops.
fn poll_timeout(timeout: Duration) -> PollTimeout {
    let mut ms = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
    if ms == 0 && !timeout.is_zero() {
        ms = 1;
    }
    PollTimeout::from(ms)
}
