/// zgate Error Types
///
/// Usage errors, readiness faults and raw socket failures for every zgate operation.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for zgate operations
#[derive(Error, Debug)]
pub enum ZgateError {
    /// IO error reported by the wrapped socket
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Async operation or exit attempted before the socket was started
    #[error("Socket not started")]
    NotStarted,

    /// Socket (or socket id) is already being monitored
    #[error("Socket already started")]
    AlreadyStarted,

    /// Socket closed
    #[error("Socket closed")]
    SocketClosed,

    /// The readiness source of one socket failed; other sockets are unaffected
    #[error("Readiness source fault: {0}")]
    SourceFault(String),

    /// The poll primitive itself failed; the owning monitor has stopped
    #[error("Poll fault: {0}")]
    PollFault(String),

    /// Monitor thread is no longer running
    #[error("Monitor stopped")]
    MonitorStopped,

    /// Send or receive wait exceeded the configured timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias for zgate operations
pub type Result<T> = std::result::Result<T, ZgateError>;

impl ZgateError {
    /// Create a source fault error with a message
    pub fn source_fault(msg: impl Into<String>) -> Self {
        Self::SourceFault(msg.into())
    }

    /// Create a poll fault error with a message
    pub fn poll_fault(msg: impl Into<String>) -> Self {
        Self::PollFault(msg.into())
    }

    /// Check if this error reports a lifecycle misuse rather than an I/O condition
    #[must_use]
    pub const fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::NotStarted | Self::AlreadyStarted | Self::SocketClosed | Self::MonitorStopped
        )
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Check if this error means the socket can no longer be used
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::SocketClosed | Self::SourceFault(_) | Self::PollFault(_) | Self::MonitorStopped
        )
    }

    /// Check if this is a raw "would block" result
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}
