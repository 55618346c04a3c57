//! Async poll across several sockets.

use futures::future::select_all;
use std::sync::Arc;
use std::time::Duration;
use zgate_core::error::Result;
use zgate_core::events::Events;
use zgate_core::gate::{GateWait, Gates};
use zgate_core::monitor::SocketId;

/// A socket an [`AsyncPoller`] can wait on.
///
/// Implemented by every [`AsyncSocket`](crate::AsyncSocket), whatever the
/// wrapped socket type, so one poller can mix them.
pub trait PollItem {
    /// Identity used to find the registration again.
    fn poll_id(&self) -> SocketId;

    /// Readiness gates of a monitored socket.
    ///
    /// # Errors
    ///
    /// `NotStarted` or `SocketClosed` when the socket is not monitored.
    fn gates(&self) -> Result<Arc<Gates>>;

    /// Current readiness, without blocking.
    ///
    /// # Errors
    ///
    /// The wrapped socket's error, or `SocketClosed`.
    fn ready(&self) -> Result<Events>;
}

/// Resolve when the first of `waits` resolves.
pub(crate) async fn wait_any(waits: Vec<GateWait<'_>>) -> Result<()> {
    if waits.is_empty() {
        return Ok(());
    }
    let (result, _, _) = select_all(waits).await;
    result
}

/// Multi-socket async poller.
///
/// ```rust,no_run
/// use zgate::prelude::*;
/// use std::time::Duration;
///
/// # async fn example() -> zgate::Result<()> {
/// let (a, b) = zgate::inproc::pair(16)?;
/// let (c, d) = zgate::inproc::pair(16)?;
/// let (a, b, c, d) = (
///     AsyncSocket::new(a),
///     AsyncSocket::new(b),
///     AsyncSocket::new(c),
///     AsyncSocket::new(d),
/// );
/// let _guards = (a.enter()?, b.enter()?, c.enter()?, d.enter()?);
///
/// let mut poller = AsyncPoller::new();
/// poller.register(&b, Events::READABLE);
/// poller.register(&d, Events::READABLE);
///
/// c.asend(Bytes::from("ping"), 0).await?;
/// for (index, ready) in poller.poll(Some(Duration::from_secs(1))).await? {
///     println!("socket {index} is {ready}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct AsyncPoller<'a> {
    items: Vec<(&'a dyn PollItem, Events)>,
}

impl<'a> AsyncPoller<'a> {
    /// Create an empty poller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `socket` for `events` and return its index.
    ///
    /// Registering a socket again replaces its mask; an empty mask
    /// unregisters it (and returns `None`).
    pub fn register(&mut self, socket: &'a dyn PollItem, events: Events) -> Option<usize> {
        let events = events & Events::ALL;
        if events.is_empty() {
            self.unregister(socket);
            return None;
        }
        let id = socket.poll_id();
        if let Some(index) = self.position(id) {
            self.items[index].1 = events;
            return Some(index);
        }
        self.items.push((socket, events));
        Some(self.items.len() - 1)
    }

    /// Stop watching `socket`. Later indices shift down by one.
    pub fn unregister(&mut self, socket: &dyn PollItem) -> bool {
        match self.position(socket.poll_id()) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of registered sockets.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no socket is registered.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn position(&self, id: SocketId) -> Option<usize> {
        self.items.iter().position(|(item, _)| item.poll_id() == id)
    }

    /// Wait until at least one registered socket is ready.
    ///
    /// Returns `(index, ready events)` for every ready registration, in
    /// registration order; empty when `timeout` elapses. `Some(Duration::ZERO)`
    /// checks once. An empty poller returns immediately.
    ///
    /// # Errors
    ///
    /// The first usage error or release reason among the registered sockets.
    pub async fn poll(&self, timeout: Option<Duration>) -> Result<Vec<(usize, Events)>> {
        if self.items.is_empty() {
            return Ok(Vec::new());
        }
        let gates = self
            .items
            .iter()
            .map(|(item, _)| item.gates())
            .collect::<Result<Vec<_>>>()?;
        let once = timeout.is_some_and(|d| d.is_zero());
        let cycle = self.cycle(&gates, once);

        match timeout {
            Some(limit) if !once => match compio::time::timeout(limit, cycle).await {
                Ok(result) => result,
                Err(_) => Ok(Vec::new()),
            },
            _ => cycle.await,
        }
    }

    async fn cycle(&self, gates: &[Arc<Gates>], once: bool) -> Result<Vec<(usize, Events)>> {
        loop {
            for (gate, (_, events)) in gates.iter().zip(&self.items) {
                gate.arm(*events);
            }

            let mut ready = Vec::new();
            for (index, (item, events)) in self.items.iter().enumerate() {
                let hit = item.ready()? & *events;
                if !hit.is_empty() {
                    ready.push((index, hit));
                }
            }
            if !ready.is_empty() || once {
                return Ok(ready);
            }

            let waits = gates
                .iter()
                .zip(&self.items)
                .flat_map(|(gate, (_, events))| events.kinds().map(move |kind| gate.get(kind).wait()))
                .collect();
            wait_any(waits).await?;
        }
    }
}
