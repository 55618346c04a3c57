//! # zgate
//!
//! Suspend async tasks on the readiness of blocking, readiness-polled
//! messaging sockets (libzmq sockets, or the built-in inproc PAIR pipe)
//! without ever blocking the async runtime.
//!
//! ## Architecture
//!
//! - **`zgate-core`**: wait gates, the poller, the monitor thread and the
//!   socket capability trait
//! - **`zgate`**: the public async surface (this crate)
//!
//! A background monitor thread polls every socket that has a suspended
//! caller. When the socket becomes ready the monitor signals a wait gate, the
//! task resumes and performs the operation with `DONTWAIT`. If that still
//! would block, the task waits again.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use zgate::prelude::*;
//!
//! # async fn example() -> zgate::Result<()> {
//! let (a, b) = zgate::inproc::pair(1000)?;
//! let a = AsyncSocket::new(a);
//! let b = AsyncSocket::new(b);
//!
//! let _a = a.enter()?;
//! let _b = b.enter()?;
//!
//! a.asend(Bytes::from("Hello"), 0).await?;
//! let reply = b.arecv(0).await?;
//! assert_eq!(reply, Bytes::from("Hello"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **`serde`** (default) - `asend_json`/`arecv_json` helpers
//! - **`zmq`** - wrap `zmq::Socket` values directly
//!
//! ```toml
//! [dependencies]
//! zgate = { version = "0.1", features = ["zmq"] }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// `tracing` subscriber setup for tests, examples and benches.
pub mod dev_tracing;
mod poll;
mod socket;

pub use bytes::Bytes;
pub use poll::{AsyncPoller, PollItem};
pub use socket::{AsyncSocket, SocketGuard, SocketState};

pub use zgate_core::error::{Result, ZgateError};
pub use zgate_core::events::{EventKind, Events, DONTWAIT, SNDMORE};
pub use zgate_core::inproc;
pub use zgate_core::monitor::{Monitor, MonitorEvent, SocketId};
pub use zgate_core::options::{MonitorConfig, SocketOptions};
pub use zgate_core::socket_type::SocketType;
pub use zgate_core::source::RawSocket;

/// Convenient imports.
///
/// ```rust
/// use zgate::prelude::*;
///
/// // Now you have:
/// // - AsyncSocket, AsyncPoller, Monitor
/// // - Events and the DONTWAIT/SNDMORE flags
/// // - Bytes for frames
/// ```
pub mod prelude {
    pub use super::{
        AsyncPoller, AsyncSocket, Bytes, EventKind, Events, Monitor, MonitorConfig, RawSocket,
        SocketOptions, SocketState, ZgateError, DONTWAIT, SNDMORE,
    };
}
