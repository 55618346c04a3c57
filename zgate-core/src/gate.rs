//! Cross-thread wait gates.
//!
//! A [`WaitGate`] is the hand-off point between the monitor thread, which
//! calls [`signal`](WaitGate::signal), and async tasks suspended on
//! [`wait`](WaitGate::wait). All state lives behind one `parking_lot` mutex
//! and wakeups go through [`Waker`]s, so the gate is runtime-agnostic.
//!
//! The protocol for a caller is always:
//!
//! 1. [`arm`](WaitGate::arm) the gate,
//! 2. try the operation without blocking,
//! 3. on "would block", await [`wait`](WaitGate::wait) and start over.
//!
//! Arming before the attempt means a signal raised between the attempt and
//! the wait is observed by the wait. Signals are level-triggered: a woken
//! caller re-checks the socket, it never consumes an edge.

use crate::error::{Result, ZgateError};
use crate::events::{EventKind, Events};
use crate::poller::Notifier;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Terminal reason a gate stops accepting waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// The socket left the monitor (exit, close or shutdown).
    Closed,
    /// The readiness source of this socket failed.
    SourceFault(String),
    /// The monitor's poll call failed.
    PollFault(String),
}

impl Release {
    pub fn to_error(&self) -> ZgateError {
        match self {
            Self::Closed => ZgateError::SocketClosed,
            Self::SourceFault(reason) => ZgateError::SourceFault(reason.clone()),
            Self::PollFault(reason) => ZgateError::PollFault(reason.clone()),
        }
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::SourceFault(reason) => write!(f, "source fault: {reason}"),
            Self::PollFault(reason) => write!(f, "poll fault: {reason}"),
        }
    }
}

#[derive(Default)]
struct GateState {
    signaled: bool,
    epoch: u64,
    next_id: u64,
    waiters: SmallVec<[(u64, Waker); 2]>,
    released: Option<Release>,
}

impl GateState {
    fn remove(&mut self, id: u64) {
        self.waiters.retain(|(waiter, _)| *waiter != id);
    }

    fn wake_all(&mut self) {
        for (_, waker) in self.waiters.drain(..) {
            waker.wake();
        }
    }
}

/// Readiness gate for one (socket, event kind) pair.
pub struct WaitGate {
    kind: EventKind,
    state: Mutex<GateState>,
    nudge: Option<Arc<Notifier>>,
}

impl WaitGate {
    /// `nudge` is raised whenever a new waiter registers, so a monitor
    /// blocked in poll rebuilds its interest set.
    pub fn new(kind: EventKind, nudge: Option<Arc<Notifier>>) -> Self {
        Self {
            kind,
            state: Mutex::new(GateState::default()),
            nudge,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Clear the signaled flag ahead of an attempt.
    pub fn arm(&self) {
        self.state.lock().signaled = false;
    }

    /// Mark the gate signaled and wake every registered waiter. Idempotent.
    pub fn signal(&self) {
        let mut state = self.state.lock();
        if state.released.is_some() {
            return;
        }
        state.signaled = true;
        state.epoch = state.epoch.wrapping_add(1);
        state.wake_all();
    }

    /// Wake every waiter with `reason` and refuse all future waits.
    ///
    /// The first release wins; later calls are ignored.
    pub fn release(&self, reason: Release) {
        let mut state = self.state.lock();
        if state.released.is_none() {
            state.released = Some(reason);
        }
        state.wake_all();
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    pub fn released(&self) -> Option<Release> {
        self.state.lock().released.clone()
    }

    /// Whether the monitor should poll for this gate's event kind.
    pub fn interested(&self) -> bool {
        let state = self.state.lock();
        !state.signaled && state.released.is_none() && !state.waiters.is_empty()
    }

    /// Number of suspended waiters.
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Suspend until the gate is signaled or released.
    pub fn wait(&self) -> GateWait<'_> {
        GateWait {
            gate: self,
            registered: None,
        }
    }
}

impl fmt::Debug for WaitGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WaitGate")
            .field("kind", &self.kind)
            .field("signaled", &state.signaled)
            .field("waiters", &state.waiters.len())
            .field("released", &state.released)
            .finish()
    }
}

/// Future returned by [`WaitGate::wait`].
///
/// Dropping it before completion removes its waker and nothing else.
#[must_use = "futures do nothing unless polled"]
pub struct GateWait<'a> {
    gate: &'a WaitGate,
    /// Waiter id and the epoch observed at registration
    registered: Option<(u64, u64)>,
}

impl Future for GateWait<'_> {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let gate = self.gate;
        let mut state = gate.state.lock();

        if let Some(err) = state.released.as_ref().map(Release::to_error) {
            if let Some((id, _)) = self.registered.take() {
                state.remove(id);
            }
            return Poll::Ready(Err(err));
        }

        match self.registered {
            None => {
                if state.signaled {
                    return Poll::Ready(Ok(()));
                }
                let id = state.next_id;
                state.next_id = state.next_id.wrapping_add(1);
                state.waiters.push((id, cx.waker().clone()));
                self.registered = Some((id, state.epoch));
                drop(state);
                if let Some(nudge) = &gate.nudge {
                    nudge.notify();
                }
                Poll::Pending
            }
            Some((id, epoch)) => {
                if state.epoch != epoch {
                    state.remove(id);
                    self.registered = None;
                    return Poll::Ready(Ok(()));
                }
                match state.waiters.iter_mut().find(|(waiter, _)| *waiter == id) {
                    Some((_, waker)) => {
                        if !waker.will_wake(cx.waker()) {
                            *waker = cx.waker().clone();
                        }
                    }
                    None => state.waiters.push((id, cx.waker().clone())),
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for GateWait<'_> {
    fn drop(&mut self) {
        if let Some((id, _)) = self.registered.take() {
            self.gate.state.lock().remove(id);
        }
    }
}

/// The pair of gates belonging to one registered socket.
#[derive(Debug)]
pub struct Gates {
    readable: WaitGate,
    writable: WaitGate,
}

impl Gates {
    pub fn new(nudge: Option<Arc<Notifier>>) -> Self {
        Self {
            readable: WaitGate::new(EventKind::Readable, nudge.clone()),
            writable: WaitGate::new(EventKind::Writable, nudge),
        }
    }

    pub fn get(&self, kind: EventKind) -> &WaitGate {
        match kind {
            EventKind::Readable => &self.readable,
            EventKind::Writable => &self.writable,
        }
    }

    /// Union of the event kinds with a live waiter.
    pub fn interest(&self) -> Events {
        EventKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind).interested())
            .fold(Events::empty(), |acc, kind| acc | kind.mask())
    }

    /// Signal every gate whose kind is in `ready`.
    pub fn signal(&self, ready: Events) {
        for kind in ready.kinds() {
            self.get(kind).signal();
        }
    }

    /// Release reason, once either gate has been released.
    pub fn released(&self) -> Option<Release> {
        self.readable.released().or_else(|| self.writable.released())
    }

    pub fn release(&self, reason: &Release) {
        self.readable.release(reason.clone());
        self.writable.release(reason.clone());
    }

    pub fn arm(&self, events: Events) {
        for kind in events.kinds() {
            self.get(kind).arm();
        }
    }
}
