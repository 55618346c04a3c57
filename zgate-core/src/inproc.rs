//! In-process PAIR transport.
//!
//! A pure-Rust [`RawSocket`] for wiring two endpoints in the same process
//! without libzmq. Each direction is a bounded channel of whole multipart
//! messages whose capacity is the high water mark.
//!
//! # Readiness
//!
//! Every endpoint owns a [`Notifier`]. The peer raises it whenever it
//! enqueues a message (we may have become readable), dequeues one (we may
//! have become writable) or goes away. [`events`](RawSocket::events) drains
//! the notifier and recomputes readiness from the queues, which gives the
//! same "descriptor fires, then ask" contract as libzmq's `ZMQ_FD`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use zgate_core::inproc::{bind_inproc, connect_inproc};
//! use zgate_core::source::RawSocket;
//! use bytes::Bytes;
//!
//! # fn example() -> std::io::Result<()> {
//! let mut server = bind_inproc("inproc://my-endpoint", 1000)?;
//! let mut client = connect_inproc("inproc://my-endpoint")?;
//!
//! client.send(Bytes::from("Hello"), 0)?;
//! assert_eq!(server.recv(0)?, Bytes::from("Hello"));
//! # Ok(())
//! # }
//! ```

use crate::events::{Events, DONTWAIT, SNDMORE};
use crate::poller::Notifier;
use crate::socket_type::SocketType;
use crate::source::RawSocket;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flume::{Receiver, Sender, TryRecvError, TrySendError};
use std::collections::VecDeque;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use tracing::{debug, trace};

/// Message type for inproc transport (multipart message)
pub type InprocMessage = Vec<Bytes>;

/// Global registry of bound endpoints, holding the half a `connect` will claim.
static INPROC_REGISTRY: once_cell::sync::Lazy<DashMap<String, InprocSocket>> =
    once_cell::sync::Lazy::new(DashMap::new);

/// One end of an in-process PAIR connection.
pub struct InprocSocket {
    tx: Sender<InprocMessage>,
    rx: Receiver<InprocMessage>,
    /// Frames sent with SNDMORE, waiting for the final frame
    outgoing: Vec<Bytes>,
    /// Remaining frames of the message being received
    incoming: VecDeque<Bytes>,
    signal: Arc<Notifier>,
    peer_signal: Arc<Notifier>,
}

/// Create two connected endpoints.
///
/// `hwm` is the number of messages each direction can hold; zero is raised to one.
pub fn pair(hwm: usize) -> io::Result<(InprocSocket, InprocSocket)> {
    let hwm = hwm.max(1);
    let (a_tx, b_rx) = flume::bounded(hwm);
    let (b_tx, a_rx) = flume::bounded(hwm);
    let a_signal = Arc::new(Notifier::new()?);
    let b_signal = Arc::new(Notifier::new()?);

    let a = InprocSocket {
        tx: a_tx,
        rx: a_rx,
        outgoing: Vec::new(),
        incoming: VecDeque::new(),
        signal: Arc::clone(&a_signal),
        peer_signal: Arc::clone(&b_signal),
    };
    let b = InprocSocket {
        tx: b_tx,
        rx: b_rx,
        outgoing: Vec::new(),
        incoming: VecDeque::new(),
        signal: b_signal,
        peer_signal: a_signal,
    };
    Ok((a, b))
}

impl InprocSocket {
    fn enqueue(&mut self, msg: InprocMessage, flags: i32) -> Result<(), InprocMessage> {
        if flags & DONTWAIT != 0 {
            match self.tx.try_send(msg) {
                Ok(()) => {}
                Err(TrySendError::Full(msg)) => return Err(msg),
                Err(TrySendError::Disconnected(_)) => return Ok(()),
            }
        } else if self.tx.send(msg).is_err() {
            return Ok(());
        }
        self.peer_signal.notify();
        Ok(())
    }

    fn ensure_connected(&self) -> io::Result<()> {
        if self.tx.is_disconnected() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "inproc peer closed"));
        }
        Ok(())
    }

    fn next_message(&mut self, flags: i32) -> io::Result<()> {
        let msg = if flags & DONTWAIT != 0 {
            match self.rx.try_recv() {
                Ok(msg) => msg,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                    return Err(io::ErrorKind::WouldBlock.into())
                }
            }
        } else {
            self.rx.recv().map_err(|_| {
                io::Error::new(io::ErrorKind::NotConnected, "inproc peer closed")
            })?
        };
        // Room freed on the peer's sending side.
        self.peer_signal.notify();
        self.incoming.extend(msg);
        Ok(())
    }
}

impl RawSocket for InprocSocket {
    fn send(&mut self, frame: Bytes, flags: i32) -> io::Result<()> {
        self.ensure_connected()?;
        if flags & SNDMORE != 0 {
            self.outgoing.push(frame);
            return Ok(());
        }
        let mut msg = std::mem::take(&mut self.outgoing);
        msg.push(frame);
        if let Err(mut msg) = self.enqueue(msg, flags) {
            msg.pop();
            self.outgoing = msg;
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.ensure_connected()
    }

    fn send_multipart(&mut self, frames: Vec<Bytes>, flags: i32) -> io::Result<()> {
        if frames.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot send an empty message",
            ));
        }
        self.ensure_connected()?;
        let kept = self.outgoing.len();
        let mut msg = std::mem::take(&mut self.outgoing);
        msg.extend(frames);
        if let Err(mut msg) = self.enqueue(msg, flags & !SNDMORE) {
            msg.truncate(kept);
            self.outgoing = msg;
            return Err(io::ErrorKind::WouldBlock.into());
        }
        trace!("[INPROC] message enqueued");
        self.ensure_connected()
    }

    fn recv(&mut self, flags: i32) -> io::Result<Bytes> {
        if self.incoming.is_empty() {
            self.next_message(flags)?;
        }
        self.incoming
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty inproc message"))
    }

    fn has_more(&mut self) -> io::Result<bool> {
        Ok(!self.incoming.is_empty())
    }

    fn events(&mut self) -> io::Result<Events> {
        self.signal.drain();
        let mut events = Events::empty();
        if !self.incoming.is_empty() || !self.rx.is_empty() {
            events |= Events::READABLE;
        }
        if self.tx.is_disconnected() || !self.tx.is_full() {
            events |= Events::WRITABLE;
        }
        Ok(events)
    }

    fn readiness_fd(&self) -> io::Result<OwnedFd> {
        self.signal.try_clone_fd()
    }

    fn socket_type(&self) -> SocketType {
        SocketType::Pair
    }
}

impl Drop for InprocSocket {
    fn drop(&mut self) {
        // Let the peer re-evaluate once our channel halves are gone.
        let peer = Arc::clone(&self.peer_signal);
        let (tx, _) = flume::bounded(1);
        let (_, rx) = flume::bounded(1);
        drop(std::mem::replace(&mut self.tx, tx));
        drop(std::mem::replace(&mut self.rx, rx));
        peer.notify();
    }
}

/// Bind to an inproc endpoint.
///
/// Creates a connected pair, returns one end, and parks the other end in the
/// global registry until [`connect_inproc`] claims it.
///
/// # Errors
///
/// Returns an error if:
/// - The endpoint doesn't start with "inproc://"
/// - The endpoint is already bound
/// - The endpoint name is empty
pub fn bind_inproc(endpoint: &str, hwm: usize) -> io::Result<InprocSocket> {
    let name = validate_and_extract_name(endpoint)?;

    match INPROC_REGISTRY.entry(name.to_string()) {
        Entry::Occupied(_) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("inproc endpoint '{}' is already bound", name),
        )),
        Entry::Vacant(slot) => {
            let (bound, parked) = pair(hwm)?;
            slot.insert(parked);
            debug!("[INPROC] Bound to {}", endpoint);
            Ok(bound)
        }
    }
}

/// Connect to an inproc endpoint.
///
/// PAIR is exclusive: the first connect claims the endpoint and removes it
/// from the registry.
///
/// # Errors
///
/// Returns an error if:
/// - The endpoint doesn't start with "inproc://"
/// - The endpoint is not bound, or already claimed
/// - The endpoint name is empty
pub fn connect_inproc(endpoint: &str) -> io::Result<InprocSocket> {
    let name = validate_and_extract_name(endpoint)?;

    if let Some((_, socket)) = INPROC_REGISTRY.remove(name) {
        debug!("[INPROC] Connected to {}", endpoint);
        return Ok(socket);
    }

    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("inproc endpoint '{}' not found (must bind before connect)", name),
    ))
}

/// Unbind an inproc endpoint that no one has connected to yet.
pub fn unbind_inproc(endpoint: &str) -> io::Result<()> {
    let name = validate_and_extract_name(endpoint)?;
    INPROC_REGISTRY.remove(name);
    Ok(())
}

/// List all inproc endpoints waiting for a connection.
///
/// Returns endpoint names without the "inproc://" prefix.
pub fn list_inproc_endpoints() -> Vec<String> {
    INPROC_REGISTRY
        .iter()
        .map(|entry| entry.key().clone())
        .collect()
}

/// Validate endpoint format and extract the name.
fn validate_and_extract_name(endpoint: &str) -> io::Result<&str> {
    const PREFIX: &str = "inproc://";

    let Some(name) = endpoint.strip_prefix(PREFIX) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "inproc endpoint must start with '{}', got: '{}'",
                PREFIX, endpoint
            ),
        ));
    };

    if name.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "inproc endpoint name cannot be empty",
        ));
    }

    Ok(name)
}
