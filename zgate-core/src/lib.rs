//! zgate Core
//!
//! This crate contains the runtime-agnostic building blocks behind `zgate`:
//! - Readiness masks and send/recv flags (`events`)
//! - The wrapped socket capability and its exclusive owner (`source`)
//! - Cross-thread wait gates (`gate`)
//! - Multiplexed readiness poll with an interrupt source (`poller`)
//! - The background monitor thread and its registry (`monitor`)
//! - In-process PAIR transport (`inproc`)
//! - libzmq adapter, behind the `zmq` feature (`zmq_source`)
//! - Error types and options (`error`, `options`)

// Only the libzmq adapter touches raw descriptors
#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod error;
pub mod events;
pub mod gate;
pub mod inproc;
pub mod monitor;
pub mod options;
pub mod poller;
pub mod socket_type;
pub mod source;

#[cfg(feature = "zmq")]
pub mod zmq_source;

// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::error::{Result, ZgateError};
    pub use crate::events::{EventKind, Events, DONTWAIT, SNDMORE};
    pub use crate::gate::{Gates, Release, WaitGate};
    pub use crate::inproc::InprocSocket;
    pub use crate::monitor::{Monitor, MonitorEvent, SocketId};
    pub use crate::options::{MonitorConfig, SocketOptions};
    pub use crate::socket_type::SocketType;
    pub use crate::source::{RawSocket, SharedSource};
}
