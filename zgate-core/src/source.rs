//! The wrapped blocking socket capability.
//!
//! A [`RawSocket`] is anything that can send and receive message frames,
//! report its current readiness without blocking, and hand out a descriptor
//! a poll call can wait on. libzmq sockets (feature `zmq`) and the
//! [`inproc`](crate::inproc) PAIR transport implement it.
//!
//! [`SharedSource`] owns the socket once it is wrapped. The facade locks it
//! for every operation; the monitor thread only `try_lock`s it to read
//! readiness, so a blocked caller never stalls the monitor.

use crate::error::{Result, ZgateError};
use crate::events::{Events, SNDMORE};
use crate::socket_type::SocketType;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::os::fd::OwnedFd;

/// Blocking, readiness-polled socket.
///
/// Operations return `io::ErrorKind::WouldBlock` when called with
/// [`DONTWAIT`](crate::events::DONTWAIT) and the socket is not ready.
pub trait RawSocket: Send + 'static {
    /// Send one frame. `SNDMORE` marks further frames of the same message.
    fn send(&mut self, frame: Bytes, flags: i32) -> io::Result<()>;

    /// Receive one frame.
    fn recv(&mut self, flags: i32) -> io::Result<Bytes>;

    /// Whether the last received frame has more frames following (`ZMQ_RCVMORE`).
    fn has_more(&mut self) -> io::Result<bool>;

    /// Current readiness, without blocking (`ZMQ_EVENTS`).
    fn events(&mut self) -> io::Result<Events>;

    /// A descriptor that becomes readable when readiness may have changed.
    ///
    /// The returned descriptor is owned by the caller. It may be edge-style,
    /// so callers must always confirm with [`events`](Self::events).
    fn readiness_fd(&self) -> io::Result<OwnedFd>;

    fn socket_type(&self) -> SocketType;

    /// Send a whole message.
    ///
    /// With `DONTWAIT`, libzmq accepts either all frames or none, so a retry
    /// after `WouldBlock` resends the complete message.
    fn send_multipart(&mut self, frames: Vec<Bytes>, flags: i32) -> io::Result<()> {
        let last = frames.len().checked_sub(1).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "cannot send an empty message")
        })?;
        for (i, frame) in frames.into_iter().enumerate() {
            let more = if i < last { SNDMORE } else { 0 };
            self.send(frame, flags | more)?;
        }
        Ok(())
    }

    /// Receive every frame of the next message.
    fn recv_multipart(&mut self, flags: i32) -> io::Result<Vec<Bytes>> {
        let mut frames = vec![self.recv(flags)?];
        while self.has_more()? {
            frames.push(self.recv(flags)?);
        }
        Ok(frames)
    }

    /// Close the socket. Dropping must have the same effect.
    fn close(self) -> io::Result<()>
    where
        Self: Sized,
    {
        drop(self);
        Ok(())
    }
}

/// Readiness probe used by the monitor thread.
pub trait Probe: Send + Sync {
    /// Query readiness without blocking.
    ///
    /// Returns `None` when the source is busy with an operation; the monitor
    /// retries on its next cycle.
    fn probe(&self) -> Option<io::Result<Events>>;
}

/// Exclusive owner of a wrapped socket.
pub struct SharedSource<S> {
    inner: Mutex<Option<S>>,
}

impl<S: RawSocket> SharedSource<S> {
    pub fn new(socket: S) -> Self {
        Self {
            inner: Mutex::new(Some(socket)),
        }
    }

    /// Run `f` against the socket. Blocks while another operation holds it.
    ///
    /// # Errors
    ///
    /// `SocketClosed` once [`close`](Self::close) has run, otherwise whatever
    /// `f` returns.
    pub fn with<T>(&self, f: impl FnOnce(&mut S) -> io::Result<T>) -> Result<T> {
        let mut guard = self.inner.lock();
        let socket = guard.as_mut().ok_or(ZgateError::SocketClosed)?;
        f(socket).map_err(ZgateError::from)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    /// Take the socket out and close it. Returns `false` if it was already closed.
    pub fn close(&self) -> io::Result<bool> {
        let socket = self.inner.lock().take();
        match socket {
            Some(socket) => socket.close().map(|()| true),
            None => Ok(false),
        }
    }
}

impl<S: RawSocket> Probe for SharedSource<S> {
    fn probe(&self) -> Option<io::Result<Events>> {
        let mut guard = self.inner.try_lock()?;
        Some(match guard.as_mut() {
            Some(socket) => socket.events(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
        })
    }
}
