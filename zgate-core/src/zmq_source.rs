//! libzmq sockets as readiness sources.
//!
//! `ZMQ_FD` is edge-style: it only tells the caller to look at `ZMQ_EVENTS`
//! again, which is exactly what the poller does.
//!
//! This is the only place that touches a raw descriptor.
#![allow(unsafe_code)]

use crate::events::Events;
use crate::socket_type::SocketType;
use crate::source::RawSocket;
use bytes::Bytes;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};

fn to_io(err: zmq::Error) -> io::Error {
    match err {
        zmq::Error::EAGAIN => io::ErrorKind::WouldBlock.into(),
        other => io::Error::from_raw_os_error(other.to_raw()),
    }
}

fn map_socket_type(kind: zmq::SocketType) -> SocketType {
    match kind {
        zmq::SocketType::PAIR => SocketType::Pair,
        zmq::SocketType::PUB => SocketType::Pub,
        zmq::SocketType::SUB => SocketType::Sub,
        zmq::SocketType::REQ => SocketType::Req,
        zmq::SocketType::REP => SocketType::Rep,
        zmq::SocketType::DEALER => SocketType::Dealer,
        zmq::SocketType::ROUTER => SocketType::Router,
        zmq::SocketType::PULL => SocketType::Pull,
        zmq::SocketType::PUSH => SocketType::Push,
        zmq::SocketType::XPUB => SocketType::XPub,
        zmq::SocketType::XSUB => SocketType::XSub,
        zmq::SocketType::STREAM => SocketType::Stream,
    }
}

impl RawSocket for zmq::Socket {
    fn send(&mut self, frame: Bytes, flags: i32) -> io::Result<()> {
        zmq::Socket::send(self, &frame[..], flags).map_err(to_io)
    }

    fn recv(&mut self, flags: i32) -> io::Result<Bytes> {
        self.recv_bytes(flags).map(Bytes::from).map_err(to_io)
    }

    fn has_more(&mut self) -> io::Result<bool> {
        self.get_rcvmore().map_err(to_io)
    }

    fn events(&mut self) -> io::Result<Events> {
        let raw = self.get_events().map_err(to_io)?;
        let mut events = Events::empty();
        if raw.contains(zmq::POLLIN) {
            events |= Events::READABLE;
        }
        if raw.contains(zmq::POLLOUT) {
            events |= Events::WRITABLE;
        }
        Ok(events)
    }

    fn readiness_fd(&self) -> io::Result<OwnedFd> {
        let fd = self.get_fd().map_err(to_io)?;
        // SAFETY: `fd` is owned by this live socket for the duration of the
        // borrow; the duplicate outlives neither the call nor the socket's
        // ownership of the original.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        borrowed.try_clone_to_owned()
    }

    fn socket_type(&self) -> SocketType {
        self.get_socket_type()
            .map(map_socket_type)
            .unwrap_or(SocketType::Pair)
    }
}
